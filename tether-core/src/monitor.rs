//! Dedicated monitor thread for targets driven through an OS debug-event
//! loop (a native process under a debug API).
//!
//! The thread that created the debuggee has to be the one that waits for its
//! debug events, so execution is owned by a [`MonitorThread`]. Resuming is a
//! two-phase handshake: the caller posts a request and signals a condition
//! variable, then meets the monitor at a barrier once the monitor has taken
//! ownership of the target. While the target runs, every other access fails
//! with `ResourceUnavailableWhileTargetRunning`.

use crate::error::{Error, Result, StatusCode};
use crate::state::TargetState;
use std::sync::{Arc, Barrier, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A debuggee whose execution is controlled through debug events.
pub trait DebugEventSource: Send + 'static {
    /// Lets the debuggee continue, for one instruction if `step` is set.
    fn resume(&mut self, step: bool) -> Result<()>;

    /// Blocks until the debuggee stops (`Halted`) or goes away (`Dead`).
    fn wait_for_event(&mut self) -> Result<TargetState>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Run,
    Step,
}

struct Control {
    request: Option<Request>,
    shutdown: bool,
    state: TargetState,
}

struct Shared<S> {
    control: Mutex<Control>,
    /// Signals a posted request or shutdown to the monitor.
    wake: Condvar,
    /// Signals a state change to callers.
    stopped: Condvar,
    /// Rendezvous confirming the monitor accepted a resume request.
    accepted: Barrier,
    source: Mutex<S>,
}

impl<S> Shared<S> {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns a debug event source on a dedicated thread and serialises
/// run and step requests to it.
pub struct MonitorThread<S: DebugEventSource> {
    shared: Arc<Shared<S>>,
    handle: Option<JoinHandle<()>>,
}

impl<S: DebugEventSource> MonitorThread<S> {
    /// Starts the monitor with a stopped debuggee.
    pub fn spawn(source: S) -> Self {
        let shared = Arc::new(Shared {
            control: Mutex::new(Control { request: None, shutdown: false, state: TargetState::Halted }),
            wake: Condvar::new(),
            stopped: Condvar::new(),
            accepted: Barrier::new(2),
            source: Mutex::new(source),
        });
        let monitor = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("tether-monitor".into())
            .spawn(move || monitor_loop(&monitor))
            .ok();
        if handle.is_none() {
            log::warn!("failed to spawn the monitor thread");
            shared.control().state = TargetState::Dead;
        }
        Self { shared, handle }
    }

    /// State as of the last reported event.
    pub fn state(&self) -> TargetState {
        self.shared.control().state
    }

    fn post(&self, request: Request) -> Result<()> {
        let operation = match request {
            Request::Run => "run",
            Request::Step => "insn_step",
        };
        {
            let mut control = self.shared.control();
            match control.state {
                TargetState::Running => {
                    return Err(Error::core(operation, None, StatusCode::ResourceUnavailableWhileTargetRunning))
                }
                TargetState::Dead => return Err(Error::dead(operation)),
                TargetState::Halted => {}
            }
            control.request = Some(request);
            control.state = TargetState::Running;
        }
        self.shared.wake.notify_one();
        self.shared.accepted.wait();
        log::trace!("monitor accepted {request:?}");
        Ok(())
    }

    /// Resumes the debuggee. Returns once the monitor thread has taken over.
    pub fn resume(&self) -> Result<()> {
        self.post(Request::Run)
    }

    /// Asks the debuggee to execute one instruction.
    pub fn step(&self) -> Result<()> {
        self.post(Request::Step)
    }

    /// Waits up to `timeout` for the debuggee to stop.
    pub fn wait_for_stop(&self, timeout: Duration) -> TargetState {
        let deadline = Instant::now() + timeout;
        let mut control = self.shared.control();
        while control.state == TargetState::Running {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            control = self
                .shared
                .stopped
                .wait_timeout(control, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        control.state
    }

    /// Runs `f` on the debuggee while it is stopped.
    pub fn with_source<R>(&self, f: impl FnOnce(&mut S) -> R) -> Result<R> {
        if self.state() == TargetState::Running {
            return Err(Error::core("access", None, StatusCode::ResourceUnavailableWhileTargetRunning));
        }
        match self.shared.source.try_lock() {
            Ok(mut source) => Ok(f(&mut source)),
            Err(std::sync::TryLockError::Poisoned(poisoned)) => Ok(f(&mut poisoned.into_inner())),
            Err(std::sync::TryLockError::WouldBlock) => {
                Err(Error::core("access", None, StatusCode::ResourceUnavailableWhileTargetRunning))
            }
        }
    }

    /// Stops the monitor thread. Blocks while the debuggee is running.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shared.control().shutdown = true;
        self.shared.wake.notify_one();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("monitor thread panicked");
            }
        }
    }
}

impl<S: DebugEventSource> Drop for MonitorThread<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn monitor_loop<S: DebugEventSource>(shared: &Shared<S>) {
    loop {
        let request = {
            let mut control = shared.control();
            loop {
                if control.shutdown {
                    return;
                }
                if let Some(request) = control.request.take() {
                    break request;
                }
                control = shared.wake.wait(control).unwrap_or_else(PoisonError::into_inner);
            }
        };
        // Own the target before telling the caller it may return.
        let mut source = shared.source.lock().unwrap_or_else(PoisonError::into_inner);
        shared.accepted.wait();

        let outcome = source.resume(request == Request::Step).and_then(|()| source.wait_for_event());
        drop(source);
        let state = outcome.unwrap_or_else(|e| {
            log::warn!("debug event loop failed: {e}");
            TargetState::Dead
        });
        log::debug!("monitor: debuggee {state}");
        shared.control().state = state;
        shared.stopped.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{Receiver, Sender};

    /// Stops whenever the test sends an event.
    struct Scripted {
        events: Receiver<TargetState>,
        resumes: Vec<bool>,
    }

    impl DebugEventSource for Scripted {
        fn resume(&mut self, step: bool) -> Result<()> {
            self.resumes.push(step);
            Ok(())
        }

        fn wait_for_event(&mut self) -> Result<TargetState> {
            self.events.recv().map_err(|_| Error::dead("wait_for_event"))
        }
    }

    fn monitor() -> (MonitorThread<Scripted>, Sender<TargetState>) {
        let (tx, events) = crossbeam_channel::unbounded();
        (MonitorThread::spawn(Scripted { events, resumes: Vec::new() }), tx)
    }

    #[test]
    fn test_access_is_refused_while_running() {
        let (monitor, events) = monitor();
        monitor.resume().unwrap();
        assert_eq!(monitor.state(), TargetState::Running);
        let err = monitor.with_source(|_| ()).unwrap_err();
        assert_eq!(err.status(), StatusCode::ResourceUnavailableWhileTargetRunning);
        assert!(monitor.step().is_err());

        events.send(TargetState::Halted).unwrap();
        assert_eq!(monitor.wait_for_stop(Duration::from_secs(5)), TargetState::Halted);
        assert_eq!(monitor.with_source(|source| source.resumes.clone()).unwrap(), vec![false]);
        monitor.shutdown();
    }

    #[test]
    fn test_step_then_exit() {
        let (monitor, events) = monitor();
        monitor.step().unwrap();
        events.send(TargetState::Halted).unwrap();
        assert_eq!(monitor.wait_for_stop(Duration::from_secs(5)), TargetState::Halted);

        monitor.resume().unwrap();
        drop(events);
        assert_eq!(monitor.wait_for_stop(Duration::from_secs(5)), TargetState::Dead);
        assert_eq!(monitor.resume().unwrap_err().status(), StatusCode::TargetCoreDead);
    }
}
