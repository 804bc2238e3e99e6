//! Connection session: Core Control over the controller wire protocol.
//!
//! Every operation is one request line followed by one reply record. The
//! reply always starts with a status token; error replies are drained to
//! their end so the next exchange starts on a clean record. Replies that do
//! not match the expected grammar, an exhausted receive buffer, or a read
//! timeout mean the channel can no longer be trusted and abort with a
//! `protocol violation` panic.

use crate::config::{EngineConfig, SessionConfig};
use crate::control::{CoreControl, RegisterMask};
use crate::debug::{strategy_for, StepCoordinator};
use crate::error::{Error, Result, StatusCode};
use crate::memory;
use crate::state::{Observer, ObserverHandle, TargetState, TargetStateMachine};
use crate::wire::{ByteSource, Request, ScanError, Scanner, Token};
use std::io::{self, Write};
use std::net::TcpStream;

/// A byte channel to a controller.
pub trait Transport: ByteSource + Write {
    /// Opens a channel to the controller at `address`.
    fn connect(address: &str) -> io::Result<Self>
    where
        Self: Sized;
}

impl Transport for TcpStream {
    fn connect(address: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[cfg(unix)]
impl Transport for std::os::unix::net::UnixStream {
    fn connect(address: &str) -> io::Result<Self> {
        std::os::unix::net::UnixStream::connect(address)
    }
}

/// Operation name and target address of the exchange in flight, for errors.
#[derive(Clone, Copy)]
struct Op {
    name: &'static str,
    address: Option<u64>,
}

impl Op {
    const fn new(name: &'static str) -> Self {
        Self { name, address: None }
    }

    const fn at(name: &'static str, address: u64) -> Self {
        Self { name, address: Some(address) }
    }

    fn error(self, status: StatusCode, hint: Option<String>) -> Error {
        Error::Core { operation: self.name, address: self.address, status, hint }
    }
}

/// The engine's connection to one target core controller.
pub struct Session<T: Transport = TcpStream> {
    config: SessionConfig,
    stream: Option<T>,
    scanner: Scanner,
    machine: TargetStateMachine,
}

impl<T: Transport> Session<T> {
    /// A disconnected session; [`CoreControl::open`] connects on demand.
    pub fn new(config: SessionConfig) -> Self {
        let scanner = Scanner::new(config.buffer_capacity, config.read_timeout);
        Self { config, stream: None, scanner, machine: TargetStateMachine::new() }
    }

    /// A session over an already established channel. The target still has
    /// to be opened.
    pub fn with_transport(config: SessionConfig, stream: T) -> Self {
        let mut session = Self::new(config);
        session.stream = Some(stream);
        session
    }

    /// Settings this session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Target state as last reported by the controller.
    pub fn state(&self) -> TargetState {
        self.machine.state()
    }

    fn ensure_connected(&self, op: Op) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(op.error(StatusCode::TargetCoreDead, None))
        }
    }

    /// Drops the channel after an I/O failure on a connected session.
    fn lose_connection(&mut self, op: Op, reason: String) -> Error {
        log::warn!("{}: connection to {} lost: {reason}", op.name, self.config.address);
        self.stream = None;
        self.machine.transition(TargetState::Dead);
        op.error(StatusCode::TargetCoreConnectionFailed, Some(reason))
    }

    /// Transmits one request line and readies the scanner for its reply.
    fn send(&mut self, op: Op, request: &Request) -> Result<()> {
        let line = request.encode();
        log::trace!("--> {}", line.trim_end());
        let Some(stream) = self.stream.as_mut() else {
            return Err(op.error(StatusCode::TargetCoreDead, None));
        };
        if let Err(e) = stream.write_all(line.as_bytes()).and_then(|()| stream.flush()) {
            return Err(self.lose_connection(op, e.to_string()));
        }
        self.scanner.reset();
        Ok(())
    }

    /// Next reply token. Connectivity failures become errors, everything
    /// else that goes wrong in the channel is fatal.
    fn token(&mut self, op: Op) -> Result<Token> {
        let token = match self.stream.as_mut() {
            Some(stream) => self.scanner.next_token(stream),
            None => Token::EndOfInput,
        };
        match self.scanner.error().cloned() {
            None => Ok(token),
            Some(ScanError::Timeout) => panic!(
                "protocol violation: timed out after {:?} waiting for the {} reply",
                self.config.read_timeout, op.name
            ),
            Some(e) if e.is_io() => Err(self.lose_connection(op, e.to_string())),
            Some(e) => panic!("protocol violation: {e} in the {} reply: {:?}", op.name, self.received()),
        }
    }

    fn received(&self) -> String {
        String::from_utf8_lossy(self.scanner.received()).trim_end().to_string()
    }

    fn violation(&self, op: Op, expected: &str, found: &Token) -> ! {
        panic!(
            "protocol violation: expected {expected} in the {} reply, found {found:?}: {:?}",
            op.name,
            self.received()
        )
    }

    /// Reads the leading status token. An error status is returned as an
    /// error after the rest of the record, including any hint, is drained.
    fn status(&mut self, op: Op) -> Result<()> {
        let status = match self.token(op)? {
            Token::Status(status) => status,
            other => self.violation(op, "a status code", &other),
        };
        if status.is_ok() {
            return Ok(());
        }
        let hint = self.drain(op)?;
        log::debug!("{} failed: {status}", op.name);
        Err(op.error(status, hint))
    }

    /// Skips to the end of the record, ignoring lexical errors, and returns
    /// the hint clause if one was present.
    fn drain(&mut self, op: Op) -> Result<Option<String>> {
        let mut tokens = Vec::new();
        loop {
            let token = match self.stream.as_mut() {
                Some(stream) => self.scanner.next_token(stream),
                None => break,
            };
            if token == Token::EndOfInput {
                break;
            }
            tokens.push(token);
        }
        match self.scanner.error().cloned() {
            Some(ScanError::Timeout) => {
                panic!("protocol violation: timed out resynchronizing after the {} reply", op.name)
            }
            Some(e) if e.is_io() => return Err(self.lose_connection(op, e.to_string())),
            _ => {}
        }
        log::trace!("<-- {}", self.received());
        Ok(tokens.windows(3).find_map(|w| match w {
            [Token::ErrmsgHint, Token::Punct('='), Token::CString(hint)] => Some(hint.clone()),
            _ => None,
        }))
    }

    fn punct(&mut self, op: Op, c: char) -> Result<()> {
        match self.token(op)? {
            Token::Punct(p) if p == c => Ok(()),
            other => self.violation(op, &format!("'{c}'"), &other),
        }
    }

    fn number(&mut self, op: Op) -> Result<i64> {
        self.punct(op, ',')?;
        match self.token(op)? {
            Token::Number(n) => Ok(n),
            other => self.violation(op, "a number", &other),
        }
    }

    fn numbers(&mut self, op: Op, count: usize) -> Result<Vec<u64>> {
        (0..count).map(|_| self.number(op).map(|n| n as u64)).collect()
    }

    fn state_token(&mut self, op: Op) -> Result<TargetState> {
        self.punct(op, ',')?;
        match self.token(op)? {
            Token::State(state) => Ok(state),
            other => self.violation(op, "a target state", &other),
        }
    }

    /// Asserts the record ends here.
    fn end(&mut self, op: Op) -> Result<()> {
        match self.token(op)? {
            Token::EndOfInput => {
                log::trace!("<-- {}", self.received());
                Ok(())
            }
            other => self.violation(op, "end of reply", &other),
        }
    }

    /// One exchange whose successful reply carries no payload.
    fn simple(&mut self, op: Op, request: &Request) -> Result<()> {
        self.send(op, request)?;
        self.status(op)?;
        self.end(op)
    }

    fn read_chunk(&mut self, address: u64, out: &mut [u8]) -> Result<()> {
        let op = Op::at("mem_read", address);
        self.send(op, &Request::MemRead { address, len: out.len() })?;
        self.status(op)?;
        for slot in out.iter_mut() {
            let value = self.number(op)?;
            *slot = u8::try_from(value).unwrap_or_else(|_| {
                panic!("protocol violation: byte value {value} in the mem_read reply")
            });
        }
        self.end(op)
    }

    fn write_chunk(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.simple(Op::at("mem_write", address), &Request::MemWrite { address, data: data.to_vec() })
    }
}

impl<T: Transport> CoreControl for Session<T> {
    fn is_connected(&self) -> bool {
        self.stream.is_some() && self.machine.state() != TargetState::Dead
    }

    fn open(&mut self) -> Result<()> {
        let op = Op::new("open");
        if self.stream.is_none() {
            let stream = T::connect(&self.config.address)
                .map_err(|source| Error::Connect { address: self.config.address.clone(), source })?;
            log::debug!("connected to controller at {}", self.config.address);
            self.stream = Some(stream);
        }
        self.send(op, &Request::CoreOpen)?;
        self.status(op)?;
        let state = self.state_token(op)?;
        self.end(op)?;
        self.machine.transition(state);
        if state == TargetState::Dead {
            return Err(op.error(StatusCode::TargetCoreConnectionFailed, None));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.stream.take().is_some() {
            log::debug!("closed connection to {}", self.config.address);
        }
        self.machine.set_silently(TargetState::Dead);
        Ok(())
    }

    fn mem_read(&mut self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_connected(Op::at("mem_read", address))?;
        let chunk_size = self.config.chunk_size;
        memory::for_each_chunk(address, buf.len(), chunk_size, |chunk| {
            self.read_chunk(chunk.address, &mut buf[chunk.range.clone()])
        })
    }

    fn mem_write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.ensure_connected(Op::at("mem_write", address))?;
        let chunk_size = self.config.chunk_size;
        memory::for_each_chunk(address, data.len(), chunk_size, |chunk| {
            self.write_chunk(chunk.address, &data[chunk.range.clone()])
        })
    }

    fn reg_read(&mut self, mask: RegisterMask) -> Result<Vec<u64>> {
        let op = Op::new("reg_read");
        self.ensure_connected(op)?;
        self.send(op, &Request::RegsRead { mask })?;
        self.status(op)?;
        let values = self.numbers(op, mask.count())?;
        self.end(op)?;
        Ok(values)
    }

    fn reg_write(&mut self, mask: RegisterMask, values: &[u64]) -> Result<()> {
        let op = Op::new("reg_write");
        assert_eq!(values.len(), mask.count(), "reg_write: value count does not match mask {mask:#x}");
        self.ensure_connected(op)?;
        self.simple(op, &Request::RegsWrite { mask, values: values.to_vec() })
    }

    fn cop_read(&mut self, coprocessor: u32, register: u32) -> Result<u64> {
        let op = Op::new("cop_read");
        self.ensure_connected(op)?;
        self.send(op, &Request::CopRead { coprocessor, register })?;
        self.status(op)?;
        let value = self.number(op)? as u64;
        self.end(op)?;
        Ok(value)
    }

    fn cop_write(&mut self, coprocessor: u32, register: u32, value: u64) -> Result<()> {
        let op = Op::new("cop_write");
        self.ensure_connected(op)?;
        self.simple(op, &Request::CopWrite { coprocessor, register, value })
    }

    fn set_break(&mut self, address: u64) -> Result<()> {
        let op = Op::at("set_break", address);
        self.ensure_connected(op)?;
        self.simple(op, &Request::BkptSet { address })
    }

    fn clear_break(&mut self, address: u64) -> Result<()> {
        let op = Op::at("clear_break", address);
        self.ensure_connected(op)?;
        self.simple(op, &Request::BkptClear { address })
    }

    fn run(&mut self) -> Result<()> {
        let op = Op::new("run");
        self.ensure_connected(op)?;
        self.simple(op, &Request::CoreRun)?;
        self.machine.transition(TargetState::Running);
        Ok(())
    }

    fn halt(&mut self) -> Result<()> {
        let op = Op::new("halt");
        self.ensure_connected(op)?;
        self.simple(op, &Request::CoreHalt)?;
        self.machine.transition(TargetState::Halted);
        Ok(())
    }

    fn insn_step(&mut self) -> Result<()> {
        let op = Op::new("insn_step");
        self.ensure_connected(op)?;
        self.simple(op, &Request::CoreInsnStep)?;
        // The halt after the step shows up on the next status poll.
        self.machine.transition(TargetState::Running);
        Ok(())
    }

    fn io_ctl(&mut self, request: &[u64]) -> Result<Vec<u64>> {
        let op = Op::new("io_ctl");
        self.ensure_connected(op)?;
        self.send(op, &Request::Ioctl { words: request.to_vec() })?;
        self.status(op)?;
        let mut words = Vec::new();
        loop {
            match self.token(op)? {
                Token::EndOfInput => break,
                Token::Punct(',') => match self.token(op)? {
                    Token::Number(n) => words.push(n as u64),
                    other => self.violation(op, "a number", &other),
                },
                other => self.violation(op, "',' or end of reply", &other),
            }
        }
        log::trace!("<-- {}", self.received());
        Ok(words)
    }

    fn get_status(&mut self) -> Result<TargetState> {
        let op = Op::new("get_status");
        // A target reported dead may come back; only a missing channel stops polling.
        if self.stream.is_none() {
            return Err(op.error(StatusCode::TargetCoreDead, None));
        }
        self.send(op, &Request::GetState)?;
        self.status(op)?;
        let state = self.state_token(op)?;
        self.end(op)?;
        self.machine.transition(state);
        Ok(state)
    }

    fn register_state_change_callback(&mut self, observer: Observer) -> ObserverHandle {
        self.machine.register(observer)
    }

    fn unregister_state_change_callback(&mut self, handle: ObserverHandle) {
        self.machine.unregister(handle);
    }
}

/// Connects to the configured controller, opens the target and wraps the
/// session in a [`StepCoordinator`] using the strategy for `config.arch`.
pub fn attach(config: &EngineConfig) -> Result<StepCoordinator<Session>> {
    config.validate()?;
    let session = Session::new(config.session_config());
    let mut coordinator =
        StepCoordinator::new(session, config.arch, strategy_for(config.arch, config.scratch_address));
    coordinator.open()?;
    log::debug!("attached to {} target at {}", config.arch, config.controller);
    Ok(coordinator)
}
