//! Controller side of the wire protocol.
//!
//! A [`Controller`] reads request lines, dispatches them to a Core Control
//! backend and writes one reply record per request. It is what the daemon
//! runs, and what tests put behind a loopback socket to exercise a
//! [`Session`](crate::Session) end to end.

use crate::control::CoreControl;
use crate::error::{Result, StatusCode};
use crate::state::TargetState;
use crate::wire::{Reply, Request};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};

/// Answers wire requests on behalf of a Core Control backend.
pub struct Controller<B: CoreControl> {
    backend: B,
    served: u64,
}

impl<B: CoreControl> Controller<B> {
    /// Serves `backend`.
    pub fn new(backend: B) -> Self {
        Self { backend, served: 0 }
    }

    /// The backend being served.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable access to the backend.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Stops serving and returns the backend.
    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Number of requests answered so far.
    pub fn served(&self) -> u64 {
        self.served
    }

    /// Answers a single request line (without its newline).
    pub fn handle_line(&mut self, line: &str) -> Reply {
        self.served += 1;
        match line.parse::<Request>() {
            Ok(request) => self.dispatch(request).unwrap_or_else(|e| {
                log::debug!("{line} failed: {e}");
                Reply::from_error(&e)
            }),
            Err(e) => {
                log::warn!("rejected request: {e}");
                Reply::error(StatusCode::TargetCtlBadParams, Some(e.to_string()))
            }
        }
    }

    fn dispatch(&mut self, request: Request) -> Result<Reply> {
        let backend = &mut self.backend;
        Ok(match request {
            Request::CoreOpen => {
                backend.open()?;
                Reply::state(backend.get_status()?)
            }
            Request::MemRead { address, len } => {
                let mut buf = vec![0; len];
                backend.mem_read(address, &mut buf)?;
                Reply::numbers(buf.into_iter().map(u64::from))
            }
            Request::MemWrite { address, data } => {
                backend.mem_write(address, &data)?;
                Reply::ok()
            }
            Request::RegsRead { mask } => Reply::numbers(backend.reg_read(mask)?),
            Request::RegsWrite { mask, values } => {
                backend.reg_write(mask, &values)?;
                Reply::ok()
            }
            Request::CopRead { coprocessor, register } => {
                Reply::numbers([backend.cop_read(coprocessor, register)?])
            }
            Request::CopWrite { coprocessor, register, value } => {
                backend.cop_write(coprocessor, register, value)?;
                Reply::ok()
            }
            Request::BkptSet { address } => {
                backend.set_break(address)?;
                Reply::ok()
            }
            Request::BkptClear { address } => {
                backend.clear_break(address)?;
                Reply::ok()
            }
            Request::CoreRun => {
                backend.run()?;
                Reply::ok()
            }
            Request::CoreHalt => {
                backend.halt()?;
                Reply::ok()
            }
            Request::CoreInsnStep => {
                backend.insn_step()?;
                Reply::ok()
            }
            Request::GetState if !backend.is_connected() => Reply::state(TargetState::Dead),
            Request::GetState => Reply::state(backend.get_status()?),
            Request::Ioctl { words } => Reply::numbers(backend.io_ctl(&words)?),
        })
    }

    /// Serves requests from `input` until it reaches end of file.
    pub fn serve(&mut self, input: impl BufRead, mut output: impl Write) -> io::Result<()> {
        for line in input.lines() {
            let line = line?;
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            log::trace!("--> {line}");
            let reply = self.handle_line(line);
            log::trace!("<-- {reply}");
            output.write_all(reply.encode().as_bytes())?;
            output.flush()?;
        }
        Ok(())
    }

    /// Serves one engine connection until the engine hangs up.
    pub fn serve_connection(&mut self, stream: TcpStream) -> io::Result<()> {
        let peer = stream.peer_addr()?;
        log::info!("engine connected from {peer}");
        stream.set_nodelay(true)?;
        let input = BufReader::new(stream.try_clone()?);
        let result = self.serve(input, stream);
        log::info!("engine {peer} disconnected");
        result
    }

    /// Accepts engine connections one at a time, forever.
    pub fn listen(&mut self, listener: &TcpListener) -> io::Result<()> {
        log::info!("controller listening on {}", listener.local_addr()?);
        for stream in listener.incoming() {
            if let Err(e) = stream.and_then(|stream| self.serve_connection(stream)) {
                log::warn!("connection dropped: {e}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::TargetArch;
    use crate::sim::SimCore;
    use std::io::Cursor;

    fn controller() -> Controller<SimCore> {
        Controller::new(SimCore::new(TargetArch::X86))
    }

    #[test]
    fn test_get_state_before_open_is_dead() {
        let mut controller = controller();
        assert_eq!(controller.handle_line("GET_STATE").encode(), "NO_ERROR, TARGET_STATE_DEAD\n");
    }

    #[test]
    fn test_open_reports_halted() {
        let mut controller = controller();
        assert_eq!(controller.handle_line("CORE_OPEN").encode(), "NO_ERROR, TARGET_STATE_HALTED\n");
    }

    #[test]
    fn test_memory_round_trip() {
        let mut controller = controller();
        controller.handle_line("CORE_OPEN");
        let reply = controller.handle_line("MEM_WRITE(0x100, 0x3, 0x1 0x2 0xff)");
        assert_eq!(reply, Reply::ok());
        assert_eq!(controller.handle_line("MEM_READ(0x100,0x3)"), Reply::numbers([1, 2, 0xff]));
    }

    #[test]
    fn test_malformed_request_is_bad_params() {
        let mut controller = controller();
        let reply = controller.handle_line("MEM_READ(0x100)");
        assert_eq!(reply.status, StatusCode::TargetCtlBadParams);
        assert!(reply.hint.is_some());
        assert_eq!(controller.served(), 1);
    }

    #[test]
    fn test_oversized_read_is_bad_params() {
        let mut controller = controller();
        controller.handle_line("CORE_OPEN");
        for line in ["MEM_READ(0x0, 0xffffffffffffffff)", "MEM_READ(0x0, 0x10001)"] {
            let reply = controller.handle_line(line);
            assert_eq!(reply.status, StatusCode::TargetCtlBadParams, "{line}");
            assert!(reply.hint.unwrap().contains("too large"));
        }
        // Still serving afterwards.
        assert_eq!(controller.handle_line("MEM_READ(0x0, 0x2)"), Reply::numbers([0, 0]));
    }

    #[test]
    fn test_failures_carry_their_status() {
        let mut controller = controller();
        let reply = controller.handle_line("CORE_RUN");
        assert_eq!(reply.status, StatusCode::TargetCoreDead);
        controller.handle_line("CORE_OPEN");
        let reply = controller.handle_line("IOCTL(0x1, 0x45490003)");
        assert_eq!(reply.status, StatusCode::TargetCtlBadParams);
    }

    #[test]
    fn test_serve_answers_each_line() {
        let mut controller = controller();
        let input = Cursor::new("CORE_OPEN\r\n\nGET_STATE\n");
        let mut output = Vec::new();
        controller.serve(input, &mut output).unwrap();
        assert_eq!(
            String::from_utf8(output).unwrap(),
            "NO_ERROR, TARGET_STATE_HALTED\nNO_ERROR, TARGET_STATE_HALTED\n"
        );
    }
}
