//! Reply records written by a controller.

use super::ERRMSG_HINT;
use crate::error::{Error, StatusCode};
use crate::state::TargetState;
use std::fmt;

/// Operation-specific part of a successful reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Payload {
    /// Status only.
    #[default]
    None,
    /// Comma-separated numbers (memory bytes, register values, ioctl words).
    Numbers(Vec<u64>),
    /// A target state keyword.
    State(TargetState),
}

/// One reply record: `STATUS[, payload][, ERRMSG_HINT = "..."]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Outcome of the request.
    pub status: StatusCode,
    /// Payload of a successful reply.
    pub payload: Payload,
    /// Human-readable explanation of a failure.
    pub hint: Option<String>,
}

impl Reply {
    /// `NO_ERROR` without payload.
    pub fn ok() -> Self {
        Self { status: StatusCode::NoError, payload: Payload::None, hint: None }
    }

    /// `NO_ERROR` followed by `values`.
    pub fn numbers(values: impl IntoIterator<Item = u64>) -> Self {
        Self { payload: Payload::Numbers(values.into_iter().collect()), ..Self::ok() }
    }

    /// `NO_ERROR` followed by a state keyword.
    pub fn state(state: TargetState) -> Self {
        Self { payload: Payload::State(state), ..Self::ok() }
    }

    /// A failure reply.
    pub fn error(status: StatusCode, hint: Option<String>) -> Self {
        Self { status, payload: Payload::None, hint }
    }

    /// Reply describing a failed operation. Generic failures without a
    /// controller hint carry the error message as their hint.
    pub fn from_error(err: &Error) -> Self {
        let status = err.status();
        let hint = match err.hint() {
            Some(hint) => Some(hint.to_string()),
            None if status == StatusCode::GenericError || !matches!(err, Error::Core { .. }) => {
                Some(err.to_string())
            }
            None => None,
        };
        Self::error(status, hint)
    }

    /// The complete reply record, including the terminating newline.
    pub fn encode(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status.keyword())?;
        match &self.payload {
            Payload::None => {}
            Payload::Numbers(values) => {
                for value in values {
                    write!(f, ", {value:#x}")?;
                }
            }
            Payload::State(state) => write!(f, ", {}", state.keyword())?,
        }
        if let Some(hint) = &self.hint {
            write!(f, ", {ERRMSG_HINT} = \"{}\"", escape(hint))?;
        }
        Ok(())
    }
}

/// Escapes a hint so the scanner decodes it back to the same text.
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            c if c.is_ascii() && !c.is_ascii_control() => out.push(c),
            // Keep the record ASCII; anything else is replaced.
            c if (c as u32) < 0x80 => out.push_str(&format!("\\x{:02x}", c as u32)),
            _ => out.push('?'),
        }
    }
    out
}
