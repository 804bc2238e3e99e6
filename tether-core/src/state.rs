//! Target execution state and the state-change observer stack.
//!
//! Observers form a strict LIFO override stack: the most recently registered
//! observer sees every transition first and decides whether older observers
//! get to see it too. Misusing the stack is a programming error and panics.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connectivity/execution state of a target core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetState {
    /// No usable connection to the core.
    Dead,
    /// Stopped and accepting register and memory access.
    Halted,
    /// Executing instructions.
    Running,
}

impl TargetState {
    /// The wire keyword for this state.
    pub const fn keyword(self) -> &'static str {
        match self {
            TargetState::Dead => "TARGET_STATE_DEAD",
            TargetState::Halted => "TARGET_STATE_HALTED",
            TargetState::Running => "TARGET_STATE_RUNNING",
        }
    }

    /// Parses a wire keyword such as `TARGET_STATE_HALTED`.
    pub fn from_keyword(word: &str) -> Option<Self> {
        [TargetState::Dead, TargetState::Halted, TargetState::Running]
            .into_iter()
            .find(|state| state.keyword() == word)
    }

    /// Whether the core is halted.
    pub const fn is_halted(self) -> bool {
        matches!(self, TargetState::Halted)
    }

    /// Whether the core is running.
    pub const fn is_running(self) -> bool {
        matches!(self, TargetState::Running)
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TargetState::Dead => "dead",
            TargetState::Halted => "halted",
            TargetState::Running => "running",
        };
        f.write_str(name)
    }
}

/// A state-change observer. Returning `true` passes the notification on to
/// the next older observer, `false` consumes it.
pub type Observer = Box<dyn FnMut(TargetState) -> bool + Send>;

/// Identifies one registration on an [`ObserverStack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

/// Maximum number of simultaneously registered observers.
pub const MAX_OBSERVERS: usize = 8;

/// Bounded LIFO stack of state-change observers.
pub struct ObserverStack {
    entries: Vec<(ObserverHandle, Observer)>,
    next_id: u64,
}

impl ObserverStack {
    /// An empty stack.
    pub fn new() -> Self {
        Self { entries: Vec::with_capacity(MAX_OBSERVERS), next_id: 0 }
    }

    /// Pushes an observer on top of the stack.
    ///
    /// # Panics
    /// If the stack already holds [`MAX_OBSERVERS`] entries.
    pub fn register(&mut self, observer: Observer) -> ObserverHandle {
        assert!(
            self.entries.len() < MAX_OBSERVERS,
            "observer stack overflow: {MAX_OBSERVERS} observers already registered"
        );
        let handle = ObserverHandle(self.next_id);
        self.next_id += 1;
        self.entries.push((handle, observer));
        handle
    }

    /// Pops the top observer, which must be the one identified by `handle`.
    ///
    /// # Panics
    /// If the stack is empty or `handle` is not the top entry.
    pub fn unregister(&mut self, handle: ObserverHandle) {
        match self.entries.last() {
            None => panic!("observer stack underflow: unregistering {handle:?} from an empty stack"),
            Some((top, _)) if *top != handle => {
                panic!("observer stack mismatch: unregistering {handle:?} but top is {top:?}")
            }
            Some(_) => {
                self.entries.pop();
            }
        }
    }

    /// Notifies observers newest-first until one consumes the notification.
    /// Returns `true` if every observer passed it on (or the stack is empty).
    pub fn dispatch(&mut self, state: TargetState) -> bool {
        for (_, observer) in self.entries.iter_mut().rev() {
            if !observer(state) {
                return false;
            }
        }
        true
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no observer is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ObserverStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Current target state plus the observers interested in its transitions.
pub struct TargetStateMachine {
    state: TargetState,
    observers: ObserverStack,
}

impl TargetStateMachine {
    /// A machine in the `Dead` state with no observers.
    pub fn new() -> Self {
        Self { state: TargetState::Dead, observers: ObserverStack::new() }
    }

    /// The current state.
    pub const fn state(&self) -> TargetState {
        self.state
    }

    /// Records a transition point and notifies the observer stack.
    ///
    /// Observers are notified on every transition point, including ones
    /// that report the state the machine was already in.
    pub fn transition(&mut self, state: TargetState) {
        if state != self.state {
            log::debug!("target state: {} -> {}", self.state, state);
        }
        self.state = state;
        self.observers.dispatch(state);
    }

    /// Changes the state without notifying anyone.
    pub fn set_silently(&mut self, state: TargetState) {
        self.state = state;
    }

    /// See [`ObserverStack::register`].
    pub fn register(&mut self, observer: Observer) -> ObserverHandle {
        self.observers.register(observer)
    }

    /// See [`ObserverStack::unregister`].
    pub fn unregister(&mut self, handle: ObserverHandle) {
        self.observers.unregister(handle);
    }
}

impl Default for TargetStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
