//! Request lines sent from the engine to a controller.

use super::scanner::parse_number;
use crate::control::RegisterMask;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Longest memory read a single request may ask for.
pub const MAX_TRANSFER: usize = 0x1_0000;

/// A single engine-to-controller request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `CORE_OPEN`
    CoreOpen,
    /// `MEM_READ(address, len)`
    MemRead { address: u64, len: usize },
    /// `MEM_WRITE(address, len, bytes...)`
    MemWrite { address: u64, data: Vec<u8> },
    /// `REGS_READ(mask)`
    RegsRead { mask: RegisterMask },
    /// `REGS_WRITE(mask, values...)`
    RegsWrite { mask: RegisterMask, values: Vec<u64> },
    /// `COP_READ(coprocessor, register)`
    CopRead { coprocessor: u32, register: u32 },
    /// `COP_WRITE(coprocessor, register, value)`
    CopWrite { coprocessor: u32, register: u32, value: u64 },
    /// `BKPT_SET(address)`
    BkptSet { address: u64 },
    /// `BKPT_CLEAR(address)`
    BkptClear { address: u64 },
    /// `CORE_RUN`
    CoreRun,
    /// `CORE_HALT`
    CoreHalt,
    /// `CORE_INSN_STEP`
    CoreInsnStep,
    /// `GET_STATE`
    GetState,
    /// `IOCTL(count, words...)`
    Ioctl { words: Vec<u64> },
}

impl Request {
    /// The request keyword.
    pub const fn verb(&self) -> &'static str {
        match self {
            Request::CoreOpen => "CORE_OPEN",
            Request::MemRead { .. } => "MEM_READ",
            Request::MemWrite { .. } => "MEM_WRITE",
            Request::RegsRead { .. } => "REGS_READ",
            Request::RegsWrite { .. } => "REGS_WRITE",
            Request::CopRead { .. } => "COP_READ",
            Request::CopWrite { .. } => "COP_WRITE",
            Request::BkptSet { .. } => "BKPT_SET",
            Request::BkptClear { .. } => "BKPT_CLEAR",
            Request::CoreRun => "CORE_RUN",
            Request::CoreHalt => "CORE_HALT",
            Request::CoreInsnStep => "CORE_INSN_STEP",
            Request::GetState => "GET_STATE",
            Request::Ioctl { .. } => "IOCTL",
        }
    }

    /// The complete request record, including the terminating newline.
    pub fn encode(&self) -> String {
        format!("{self}\n")
    }
}

fn join_hex<T: fmt::LowerHex>(values: &[T], separator: &str) -> String {
    values.iter().map(|v| format!("{v:#x}")).collect::<Vec<_>>().join(separator)
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = self.verb();
        match self {
            Request::CoreOpen
            | Request::CoreRun
            | Request::CoreHalt
            | Request::CoreInsnStep
            | Request::GetState => f.write_str(verb),
            Request::MemRead { address, len } => write!(f, "{verb}({address:#x}, {len:#x})"),
            Request::MemWrite { address, data } => {
                write!(f, "{verb}({address:#x}, {:#x}, {})", data.len(), join_hex(data, " "))
            }
            Request::RegsRead { mask } => write!(f, "{verb}({mask:#x})"),
            Request::RegsWrite { mask, values } => {
                write!(f, "{verb}({mask:#x}, {})", join_hex(values, " "))
            }
            Request::CopRead { coprocessor, register } => {
                write!(f, "{verb}({coprocessor:#x}, {register:#x})")
            }
            Request::CopWrite { coprocessor, register, value } => {
                write!(f, "{verb}({coprocessor:#x}, {register:#x}, {value:#x})")
            }
            Request::BkptSet { address } | Request::BkptClear { address } => {
                write!(f, "{verb}({address:#x})")
            }
            Request::Ioctl { words } if words.is_empty() => write!(f, "{verb}(0x0)"),
            Request::Ioctl { words } => write!(f, "{verb}({:#x}, {})", words.len(), join_hex(words, ", ")),
        }
    }
}

/// A request line that does not follow the request grammar.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed request '{line}': {reason}")]
pub struct ParseRequestError {
    /// The offending line.
    pub line: String,
    /// What is wrong with it.
    pub reason: String,
}

impl FromStr for Request {
    type Err = ParseRequestError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let err = |reason: &str| ParseRequestError { line: line.to_string(), reason: reason.to_string() };

        let (verb, args) = match line.find('(') {
            Some(open) => {
                let inner = line[open + 1..].strip_suffix(')').ok_or_else(|| err("missing ')'"))?;
                (line[..open].trim(), parse_args(inner).ok_or_else(|| err("bad argument"))?)
            }
            None => (line, Vec::new()),
        };

        let arity = |n: usize| if args.len() == n { Ok(()) } else { Err(err("wrong argument count")) };
        let byte = |v: u64| u8::try_from(v).map_err(|_| err("byte out of range"));
        let word = |v: u64| u32::try_from(v).map_err(|_| err("value out of range"));

        let request = match verb {
            "CORE_OPEN" => Request::CoreOpen,
            "CORE_RUN" => Request::CoreRun,
            "CORE_HALT" => Request::CoreHalt,
            "CORE_INSN_STEP" => Request::CoreInsnStep,
            "GET_STATE" => Request::GetState,
            "MEM_READ" => {
                arity(2)?;
                let len = usize::try_from(args[1])
                    .ok()
                    .filter(|&len| len <= MAX_TRANSFER)
                    .ok_or_else(|| err("read length too large"))?;
                Request::MemRead { address: args[0], len }
            }
            "MEM_WRITE" => {
                if args.len() < 2 || args[1] as usize != args.len() - 2 {
                    return Err(err("byte count does not match length"));
                }
                let data = args[2..].iter().map(|&v| byte(v)).collect::<Result<_, _>>()?;
                Request::MemWrite { address: args[0], data }
            }
            "REGS_READ" => {
                arity(1)?;
                Request::RegsRead { mask: RegisterMask::new(word(args[0])?) }
            }
            "REGS_WRITE" => {
                let mask = RegisterMask::new(word(*args.first().ok_or_else(|| err("missing mask"))?)?);
                if mask.count() != args.len() - 1 {
                    return Err(err("value count does not match mask"));
                }
                Request::RegsWrite { mask, values: args[1..].to_vec() }
            }
            "COP_READ" => {
                arity(2)?;
                Request::CopRead { coprocessor: word(args[0])?, register: word(args[1])? }
            }
            "COP_WRITE" => {
                arity(3)?;
                Request::CopWrite { coprocessor: word(args[0])?, register: word(args[1])?, value: args[2] }
            }
            "BKPT_SET" => {
                arity(1)?;
                Request::BkptSet { address: args[0] }
            }
            "BKPT_CLEAR" => {
                arity(1)?;
                Request::BkptClear { address: args[0] }
            }
            "IOCTL" => {
                let len = *args.first().ok_or_else(|| err("missing length"))? as usize;
                if len != args.len() - 1 {
                    return Err(err("word count does not match length"));
                }
                Request::Ioctl { words: args[1..].to_vec() }
            }
            _ => return Err(err("unknown verb")),
        };
        Ok(request)
    }
}

/// Splits an argument list on commas and whitespace.
fn parse_args(inner: &str) -> Option<Vec<u64>> {
    inner
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|arg| !arg.is_empty())
        .map(|arg| parse_number(arg).map(|v| v as u64))
        .collect()
}
