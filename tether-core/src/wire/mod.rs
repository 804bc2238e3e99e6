//! Line-oriented wire protocol spoken with a target core controller.
//!
//! Requests are single `\n`-terminated ASCII lines such as
//! `MEM_READ(0x20000000, 0x40)`. Replies start with a status keyword, followed
//! by an operation-specific payload and optionally an `ERRMSG_HINT = "..."`
//! clause. The [`Scanner`] turns reply bytes into [`Token`]s.

/// Reply records.
pub mod reply;
/// Request lines.
pub mod request;
/// Reply tokenizer.
pub mod scanner;

pub use reply::{Payload, Reply};
pub use request::{ParseRequestError, Request, MAX_TRANSFER};
pub use scanner::{ByteSource, ScanError, Scanner};

use crate::error::StatusCode;
use crate::state::TargetState;

/// Keyword introducing a hint message on an error reply.
pub const ERRMSG_HINT: &str = "ERRMSG_HINT";

/// One lexical element of a controller reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// End of the current reply record.
    EndOfInput,
    /// Leading status keyword.
    Status(StatusCode),
    /// Decimal or `0x` hexadecimal number.
    Number(i64),
    /// Target state keyword.
    State(TargetState),
    /// The `ERRMSG_HINT` keyword.
    ErrmsgHint,
    /// Decoded string literal.
    CString(String),
    /// One of `,` `(` `)` `=`.
    Punct(char),
}
