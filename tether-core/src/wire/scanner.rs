//! Reply tokenizer.
//!
//! The scanner owns a fixed-size receive buffer with two cursors: `fill`
//! (first free byte) and `scan` (first byte not yet tokenized). Bytes are
//! pulled lazily from a [`ByteSource`] whenever the scan cursor catches up
//! with the fill cursor. A reply record ends at `\n`; from then on the
//! scanner keeps returning [`Token::EndOfInput`] until it is reset.
//!
//! Errors never interrupt scanning. They are recorded in a sticky field and
//! the offending input is skipped, so callers can always drain a reply to
//! its end.

use super::{Token, ERRMSG_HINT};
use crate::error::StatusCode;
use crate::state::TargetState;
use std::io::{self, Read};
use std::net::TcpStream;
use std::time::Duration;
use thiserror::Error;

/// Default time to wait for more reply bytes.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// A byte stream that can be read with a bounded wait.
pub trait ByteSource {
    /// Reads at least one byte into `buf`, waiting at most `timeout`.
    /// `Ok(0)` means the peer closed the stream.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

impl ByteSource for TcpStream {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.set_read_timeout(Some(timeout))?;
        self.read(buf)
    }
}

#[cfg(unix)]
impl ByteSource for std::os::unix::net::UnixStream {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.set_read_timeout(Some(timeout))?;
        self.read(buf)
    }
}

/// In-memory source; never blocks.
impl<T: AsRef<[u8]>> ByteSource for io::Cursor<T> {
    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        self.read(buf)
    }
}

/// Sticky scanner failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// No data arrived within the read timeout.
    #[error("timed out waiting for reply data")]
    Timeout,
    /// The peer closed the stream.
    #[error("controller closed the connection")]
    Disconnected,
    /// Reading failed.
    #[error("read failed: {0:?}")]
    Io(io::ErrorKind),
    /// An identifier that is not a status, state or hint keyword.
    #[error("unknown keyword '{0}'")]
    UnknownKeyword(String),
    /// A number that does not parse or overflows.
    #[error("malformed number '{0}'")]
    BadNumber(String),
    /// End of record inside a string literal.
    #[error("unterminated string literal")]
    UnterminatedString,
    /// Unsupported escape in a string literal.
    #[error("invalid escape sequence '\\{0}'")]
    BadEscape(char),
    /// A byte no token starts with.
    #[error("unexpected byte {0:#04x}")]
    UnexpectedByte(u8),
}

impl ScanError {
    /// Whether the byte stream itself failed, as opposed to its content.
    pub const fn is_io(&self) -> bool {
        matches!(self, ScanError::Timeout | ScanError::Disconnected | ScanError::Io(_))
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal number with an optional
/// leading `-`. Hex values use the full 64-bit range.
pub fn parse_number(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) if !hex.is_empty() && hex.bytes().all(|b| b.is_ascii_hexdigit()) => {
            u64::from_str_radix(hex, 16).ok()? as i64
        }
        Some(_) => return None,
        None if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
            digits.parse::<i64>().ok()?
        }
        None => return None,
    };
    Some(if negative { value.wrapping_neg() } else { value })
}

/// Turns reply bytes into tokens.
pub struct Scanner {
    buf: Box<[u8]>,
    fill: usize,
    scan: usize,
    error: Option<ScanError>,
    source_failed: bool,
    timeout: Duration,
}

impl Scanner {
    /// A scanner buffering at most `capacity` bytes of one record.
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        assert!(capacity >= 2, "receive buffer needs room for at least one byte");
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            fill: 0,
            scan: 0,
            error: None,
            source_failed: false,
            timeout,
        }
    }

    /// Size of the receive buffer.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Changes the read timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Starts a new exchange: clears both cursors and the sticky error.
    pub fn reset(&mut self) {
        self.fill = 0;
        self.scan = 0;
        self.error = None;
        self.source_failed = false;
    }

    /// The most recent error since the last reset.
    pub fn error(&self) -> Option<&ScanError> {
        self.error.as_ref()
    }

    /// Bytes received in the current exchange.
    pub fn received(&self) -> &[u8] {
        &self.buf[..self.fill]
    }

    /// Produces the next token of the current reply.
    pub fn next_token(&mut self, source: &mut impl ByteSource) -> Token {
        loop {
            let Some(byte) = self.peek(source) else {
                return Token::EndOfInput;
            };
            match byte {
                b' ' | b'\t' | b'\r' => self.scan += 1,
                b'\n' => return Token::EndOfInput,
                b',' | b'(' | b')' | b'=' => {
                    self.scan += 1;
                    return Token::Punct(byte as char);
                }
                b'"' => {
                    self.scan += 1;
                    if let Some(token) = self.string(source) {
                        return token;
                    }
                }
                b'-' | b'0'..=b'9' => {
                    if let Some(token) = self.number(source) {
                        return token;
                    }
                }
                b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
                    if let Some(token) = self.keyword(source) {
                        return token;
                    }
                }
                other => {
                    self.scan += 1;
                    self.fail(ScanError::UnexpectedByte(other));
                }
            }
        }
    }

    fn fail(&mut self, error: ScanError) {
        log::warn!("reply scanner: {error}");
        self.error = Some(error);
    }

    /// Returns the byte under the scan cursor, reading more input if needed.
    fn peek(&mut self, source: &mut impl ByteSource) -> Option<u8> {
        while self.scan == self.fill {
            if self.source_failed || !self.refill(source) {
                return None;
            }
        }
        Some(self.buf[self.scan])
    }

    /// Appends fresh bytes after the fill cursor.
    ///
    /// # Panics
    /// If the buffer is full: a reply that does not fit cannot be scanned.
    fn refill(&mut self, source: &mut impl ByteSource) -> bool {
        let limit = self.buf.len() - 1;
        if self.fill >= limit {
            panic!(
                "protocol violation: receive buffer exhausted ({} bytes) before end of reply",
                self.buf.len()
            );
        }
        loop {
            match source.read_timeout(&mut self.buf[self.fill..limit], self.timeout) {
                Ok(0) => {
                    self.source_failed = true;
                    self.fail(ScanError::Disconnected);
                    return false;
                }
                Ok(count) => {
                    self.fill += count;
                    return true;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.source_failed = true;
                    let error = match e.kind() {
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ScanError::Timeout,
                        kind => ScanError::Io(kind),
                    };
                    self.fail(error);
                    return false;
                }
            }
        }
    }

    /// Collects bytes while `accept` holds.
    fn collect(&mut self, source: &mut impl ByteSource, accept: impl Fn(u8) -> bool) -> String {
        let mut text = String::new();
        while let Some(byte) = self.peek(source) {
            if !accept(byte) {
                break;
            }
            text.push(byte as char);
            self.scan += 1;
        }
        text
    }

    fn number(&mut self, source: &mut impl ByteSource) -> Option<Token> {
        let mut text = String::new();
        if self.peek(source) == Some(b'-') {
            text.push('-');
            self.scan += 1;
        }
        text.push_str(&self.collect(source, |b| b.is_ascii_alphanumeric()));
        match parse_number(&text) {
            Some(value) => Some(Token::Number(value)),
            None => {
                self.fail(ScanError::BadNumber(text));
                None
            }
        }
    }

    fn keyword(&mut self, source: &mut impl ByteSource) -> Option<Token> {
        let word = self.collect(source, |b| b.is_ascii_alphanumeric() || b == b'_');
        if let Some(status) = StatusCode::from_keyword(&word) {
            return Some(Token::Status(status));
        }
        if let Some(state) = TargetState::from_keyword(&word) {
            return Some(Token::State(state));
        }
        if word == ERRMSG_HINT {
            return Some(Token::ErrmsgHint);
        }
        self.fail(ScanError::UnknownKeyword(word));
        None
    }

    /// Scans a C-style string literal; the opening quote is already consumed.
    fn string(&mut self, source: &mut impl ByteSource) -> Option<Token> {
        let mut bytes = Vec::new();
        loop {
            match self.peek(source) {
                None | Some(b'\n') => {
                    self.fail(ScanError::UnterminatedString);
                    return None;
                }
                Some(b'"') => {
                    self.scan += 1;
                    return Some(Token::CString(String::from_utf8_lossy(&bytes).into_owned()));
                }
                Some(b'\\') => {
                    self.scan += 1;
                    if let Some(byte) = self.escape(source) {
                        bytes.push(byte);
                    }
                }
                Some(byte) => {
                    self.scan += 1;
                    bytes.push(byte);
                }
            }
        }
    }

    fn escape(&mut self, source: &mut impl ByteSource) -> Option<u8> {
        let byte = match self.peek(source)? {
            b'\n' => return None,
            byte => byte,
        };
        self.scan += 1;
        let decoded = match byte {
            b'n' => b'\n',
            b't' => b'\t',
            b'r' => b'\r',
            b'0' => 0,
            b'\\' | b'"' | b'\'' => byte,
            b'x' => {
                let mut value = 0u8;
                for _ in 0..2 {
                    match self.peek(source).and_then(|b| (b as char).to_digit(16)) {
                        Some(digit) => {
                            value = value << 4 | digit as u8;
                            self.scan += 1;
                        }
                        None => {
                            self.fail(ScanError::BadEscape('x'));
                            return None;
                        }
                    }
                }
                value
            }
            other => {
                self.fail(ScanError::BadEscape(other as char));
                other
            }
        };
        Some(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn tokens(input: &str) -> (Vec<Token>, Option<ScanError>) {
        let mut scanner = Scanner::new(256, DEFAULT_READ_TIMEOUT);
        let mut source = Cursor::new(input.as_bytes().to_vec());
        let mut out = Vec::new();
        loop {
            let token = scanner.next_token(&mut source);
            if token == Token::EndOfInput {
                break;
            }
            out.push(token);
        }
        (out, scanner.error().cloned())
    }

    /// Hands out at most `step` bytes per read.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
        reads: usize,
    }

    impl ByteSource for Trickle {
        fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
            self.reads += 1;
            if self.pos == self.data.len() {
                return Err(io::ErrorKind::TimedOut.into());
            }
            let count = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..count].copy_from_slice(&self.data[self.pos..self.pos + count]);
            self.pos += count;
            Ok(count)
        }
    }

    #[test]
    fn test_reply_with_payload() {
        let (tokens, error) = tokens("NO_ERROR, 0x1f, 42, -3\n");
        assert_eq!(
            tokens,
            vec![
                Token::Status(StatusCode::NoError),
                Token::Punct(','),
                Token::Number(0x1f),
                Token::Punct(','),
                Token::Number(42),
                Token::Punct(','),
                Token::Number(-3),
            ]
        );
        assert!(error.is_none());
    }

    #[test]
    fn test_state_and_hint_keywords() {
        let (first, _) = tokens("GENERIC_ERROR, ERRMSG_HINT = \"no \\\"jtag\\\"\\n\\x41\"\n");
        assert_eq!(
            first,
            vec![
                Token::Status(StatusCode::GenericError),
                Token::Punct(','),
                Token::ErrmsgHint,
                Token::Punct('='),
                Token::CString("no \"jtag\"\nA".to_string()),
            ]
        );
        let (more, _) = tokens("NO_ERROR, TARGET_STATE_RUNNING\n");
        assert_eq!(more[2], Token::State(TargetState::Running));
    }

    #[test]
    fn test_full_range_hex() {
        assert_eq!(parse_number("0xffffffffffffffff"), Some(-1));
        assert_eq!(parse_number("0x"), None);
        assert_eq!(parse_number("12ab"), None);
        assert_eq!(parse_number("-0x10"), Some(-16));
    }

    #[test]
    fn test_errors_are_sticky_and_skipped() {
        let (tokens, error) = tokens("NO_ERROR, BOGUS, 7 ?\n");
        assert_eq!(
            tokens,
            vec![
                Token::Status(StatusCode::NoError),
                Token::Punct(','),
                Token::Punct(','),
                Token::Number(7),
            ]
        );
        assert_eq!(error, Some(ScanError::UnexpectedByte(b'?')));
    }

    #[test]
    fn test_unterminated_string_stops_at_record_end() {
        let (tokens, error) = tokens("GENERIC_ERROR, ERRMSG_HINT = \"oops\n");
        assert_eq!(tokens.len(), 4);
        assert_eq!(error, Some(ScanError::UnterminatedString));
    }

    #[test]
    fn test_end_of_input_repeats_until_reset() {
        let mut scanner = Scanner::new(64, DEFAULT_READ_TIMEOUT);
        let mut source = Cursor::new(b"NO_ERROR\nTARGET_CORE_DEAD\n".to_vec());
        assert_eq!(scanner.next_token(&mut source), Token::Status(StatusCode::NoError));
        assert_eq!(scanner.next_token(&mut source), Token::EndOfInput);
        assert_eq!(scanner.next_token(&mut source), Token::EndOfInput);
        assert!(scanner.error().is_none());
    }

    #[test]
    fn test_lazy_refill_across_split_tokens() {
        let mut scanner = Scanner::new(64, DEFAULT_READ_TIMEOUT);
        let mut source = Trickle {
            data: b"TARGET_CTL_BAD_PARAMS, 0x1234\n".to_vec(),
            pos: 0,
            step: 3,
            reads: 0,
        };
        assert_eq!(scanner.next_token(&mut source), Token::Status(StatusCode::TargetCtlBadParams));
        assert_eq!(scanner.next_token(&mut source), Token::Punct(','));
        assert_eq!(scanner.next_token(&mut source), Token::Number(0x1234));
        assert_eq!(scanner.next_token(&mut source), Token::EndOfInput);
        assert!(source.reads > 5);
        assert_eq!(scanner.received().last(), Some(&b'\n'));
    }

    #[test]
    fn test_timeout_is_recorded_once() {
        let mut scanner = Scanner::new(64, Duration::from_millis(1));
        let mut source = Trickle { data: b"NO_ERROR".to_vec(), pos: 0, step: 64, reads: 0 };
        assert_eq!(scanner.next_token(&mut source), Token::Status(StatusCode::NoError));
        assert_eq!(scanner.next_token(&mut source), Token::EndOfInput);
        assert_eq!(scanner.next_token(&mut source), Token::EndOfInput);
        assert_eq!(scanner.error(), Some(&ScanError::Timeout));
        assert_eq!(source.reads, 2);
    }

    #[test]
    #[should_panic(expected = "receive buffer exhausted")]
    fn test_buffer_exhaustion_is_fatal() {
        let mut scanner = Scanner::new(16, DEFAULT_READ_TIMEOUT);
        let mut source = Cursor::new(vec![b' '; 64]);
        scanner.next_token(&mut source);
    }
}
