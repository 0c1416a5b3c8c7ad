//! Callback delivery gate
//!
//! Session and subscription drivers run on spawned tasks and report to
//! caller-supplied callbacks. Once a handle is stopped, no callback may start
//! and `close()` only returns after an in-flight callback on another thread
//! has finished. Closing from inside a callback is allowed.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

#[derive(Debug)]
struct GateState {
    open: bool,
    delivering_on: Option<ThreadId>,
}

#[derive(Debug)]
pub(crate) struct CallbackGate {
    state: Mutex<GateState>,
    idle: Condvar,
}

impl CallbackGate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                open: true,
                delivering_on: None,
            }),
            idle: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` unless the gate is closed; returns whether it ran
    pub(crate) fn deliver(&self, f: impl FnOnce()) -> bool {
        {
            let mut state = self.lock();
            if !state.open {
                return false;
            }
            state.delivering_on = Some(thread::current().id());
        }

        f();

        self.lock().delivering_on = None;
        self.idle.notify_all();
        true
    }

    /// Close the gate; returns `true` only for the call that closed it
    pub(crate) fn close(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.lock();
        let was_open = state.open;
        state.open = false;

        while matches!(state.delivering_on, Some(id) if id != me) {
            state = self.idle.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        was_open
    }

    pub(crate) fn is_open(&self) -> bool {
        self.lock().open
    }
}
