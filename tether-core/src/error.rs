//! Error types shared by every Core Control backend.
//!
//! Wire status codes map 1:1 onto [`StatusCode`]. Local conditions that never
//! travel over the wire (bookkeeping conflicts, partial transfers, socket
//! failures) get their own [`Error`] variants but still map back onto a
//! status code through [`Error::status`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Status code carried as the first token of every controller reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// The operation succeeded.
    NoError,
    /// Failure without a more specific code.
    GenericError,
    /// The controller or the core could not be reached.
    TargetCoreConnectionFailed,
    /// The core is not connected.
    TargetCoreDead,
    /// The request was malformed or not supported.
    TargetCtlBadParams,
    /// Target memory could not be read.
    TargetCtlMemReadError,
    /// The debug interface failed to access the core.
    TargetAccessError,
    /// A breakpoint already exists at the address.
    BkptAlreadySetAtAddr,
    /// No hardware breakpoint resource is left.
    CantSetHwBkpt,
    /// Not allowed while the core runs.
    ResourceUnavailableWhileTargetRunning,
}

impl StatusCode {
    /// All status codes, in wire enumeration order.
    pub const ALL: [StatusCode; 10] = [
        StatusCode::NoError,
        StatusCode::GenericError,
        StatusCode::TargetCoreConnectionFailed,
        StatusCode::TargetCoreDead,
        StatusCode::TargetCtlBadParams,
        StatusCode::TargetCtlMemReadError,
        StatusCode::TargetAccessError,
        StatusCode::BkptAlreadySetAtAddr,
        StatusCode::CantSetHwBkpt,
        StatusCode::ResourceUnavailableWhileTargetRunning,
    ];

    /// The keyword spelling used on the wire.
    pub const fn keyword(self) -> &'static str {
        match self {
            StatusCode::NoError => "NO_ERROR",
            StatusCode::GenericError => "GENERIC_ERROR",
            StatusCode::TargetCoreConnectionFailed => "TARGET_CORE_CONNECTION_FAILED",
            StatusCode::TargetCoreDead => "TARGET_CORE_DEAD",
            StatusCode::TargetCtlBadParams => "TARGET_CTL_BAD_PARAMS",
            StatusCode::TargetCtlMemReadError => "TARGET_CTL_MEM_READ_ERROR",
            StatusCode::TargetAccessError => "TARGET_ACCESS_ERROR",
            StatusCode::BkptAlreadySetAtAddr => "BKPT_ALREADY_SET_AT_ADDR",
            StatusCode::CantSetHwBkpt => "CANT_SET_HW_BKPT",
            StatusCode::ResourceUnavailableWhileTargetRunning => {
                "RESOURCE_UNAVAILABLE_WHILE_TARGET_RUNNING"
            }
        }
    }

    /// Looks up a status code by its wire keyword.
    pub fn from_keyword(word: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.keyword() == word)
    }

    /// Whether this is [`StatusCode::NoError`].
    pub const fn is_ok(self) -> bool {
        matches!(self, StatusCode::NoError)
    }

    /// Connectivity errors: the caller may reconnect and retry.
    pub const fn is_connectivity(self) -> bool {
        matches!(self, StatusCode::TargetCoreConnectionFailed | StatusCode::TargetCoreDead)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Errors returned by Core Control operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The controller (or a local backend) rejected the operation.
    #[error("{operation}{} failed: {status}{}", fmt_address(.address), fmt_hint(.hint))]
    Core {
        operation: &'static str,
        address: Option<u64>,
        status: StatusCode,
        hint: Option<String>,
    },
    /// A chunked memory transfer stopped part-way.
    #[error("transfer stopped after {transferred} bytes")]
    PartialTransfer {
        transferred: usize,
        #[source]
        source: Box<Error>,
    },
    /// The table, or the target, already has a breakpoint there.
    #[error("a breakpoint is already set at {0:#010x}")]
    BreakpointAlreadySet(u64),
    /// The table has no breakpoint there.
    #[error("no breakpoint is set at {0:#010x}")]
    BreakpointNotFound(u64),
    /// Opening the channel to the controller failed.
    #[error("unable to connect to target controller at {address}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

fn fmt_address(address: &Option<u64>) -> String {
    address.map(|a| format!(" @ {a:#010x}")).unwrap_or_default()
}

fn fmt_hint(hint: &Option<String>) -> String {
    hint.as_ref().map(|h| format!(" ({h})")).unwrap_or_default()
}

impl Error {
    /// Shorthand for a status-code failure without a hint.
    pub const fn core(operation: &'static str, address: Option<u64>, status: StatusCode) -> Self {
        Error::Core { operation, address, status, hint: None }
    }

    /// The failure reported when the target is not connected.
    pub const fn dead(operation: &'static str) -> Self {
        Self::core(operation, None, StatusCode::TargetCoreDead)
    }

    /// The wire status code equivalent to this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Core { status, .. } => *status,
            Error::PartialTransfer { source, .. } => source.status(),
            Error::BreakpointAlreadySet(_) => StatusCode::BkptAlreadySetAtAddr,
            Error::BreakpointNotFound(_) => StatusCode::TargetCtlBadParams,
            Error::Connect { .. } => StatusCode::TargetCoreConnectionFailed,
            Error::Config(_) => StatusCode::TargetCtlBadParams,
        }
    }

    /// Bytes moved before a chunked transfer failed; zero for any other error.
    pub fn transferred(&self) -> usize {
        match self {
            Error::PartialTransfer { transferred, .. } => *transferred,
            _ => 0,
        }
    }

    /// The controller's hint message, meant to be shown to the user verbatim.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Error::Core { hint, .. } => hint.as_deref(),
            Error::PartialTransfer { source, .. } => source.hint(),
            _ => None,
        }
    }
}

/// Result type of every Core Control operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_round_trip() {
        for code in StatusCode::ALL {
            assert_eq!(StatusCode::from_keyword(code.keyword()), Some(code));
        }
        assert_eq!(StatusCode::from_keyword("NOT_A_STATUS"), None);
    }

    #[test]
    fn test_core_error_message_carries_context() {
        let err = Error::Core {
            operation: "mem_read",
            address: Some(0x2000_0000),
            status: StatusCode::TargetCtlMemReadError,
            hint: Some("bus fault".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "mem_read @ 0x20000000 failed: TARGET_CTL_MEM_READ_ERROR (bus fault)"
        );
        assert_eq!(err.hint(), Some("bus fault"));
    }

    #[test]
    fn test_partial_transfer_reports_count_and_inner_status() {
        let err = Error::PartialTransfer {
            transferred: 128,
            source: Box::new(Error::core("mem_read", Some(0x80), StatusCode::TargetAccessError)),
        };
        assert_eq!(err.transferred(), 128);
        assert_eq!(err.status(), StatusCode::TargetAccessError);
        assert_eq!(Error::dead("run").transferred(), 0);
    }
}
