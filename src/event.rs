//! Small synchronisation primitives the engine chains its callbacks with.
//!
//! None of them ever block waiting for an event: listeners are either
//! queued or run right away on the thread that fires the event. Listeners
//! always run outside of internal locks, so they may freely re-enter.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) type Listener = Box<dyn FnOnce() + Send>;

/// Locks a mutex, ignoring poisoning. Nothing the engine guards can be left
/// half-updated by a panic, since listeners never run under a lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum EventState {
    Pending(Vec<Listener>),
    Fired,
    Discarded,
}

/// Single-fire broadcast.
///
/// Every registered listener runs exactly once: on [`fire`](Self::fire), or
/// immediately on registration if the event has already fired. A discarded
/// event drops its listeners without running them and refuses new ones.
pub(crate) struct OneShotEvent {
    state: Mutex<EventState>,
}

impl OneShotEvent {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EventState::Pending(Vec::new())),
        }
    }

    /// Queues the listener, or runs it if the event already fired. Hands
    /// the listener back if the event was discarded.
    pub fn register_or_notify(&self, listener: Listener) -> Result<(), Listener> {
        let mut state = lock(&self.state);
        match &mut *state {
            EventState::Pending(listeners) => {
                listeners.push(listener);
                return Ok(());
            }
            EventState::Discarded => return Err(listener),
            EventState::Fired => {}
        }
        drop(state);

        listener();
        Ok(())
    }

    /// Runs all queued listeners. Returns `false` if the event had already
    /// fired or was discarded.
    pub fn fire(&self) -> bool {
        let listeners = {
            let mut state = lock(&self.state);
            match mem::replace(&mut *state, EventState::Fired) {
                EventState::Pending(listeners) => listeners,
                other => {
                    *state = other;
                    return false;
                }
            }
        };

        for listener in listeners {
            listener();
        }
        true
    }

    /// Drops queued listeners without running them.
    pub fn discard(&self) {
        let dropped = mem::replace(&mut *lock(&self.state), EventState::Discarded);
        drop(dropped);
    }

    #[cfg(test)]
    pub fn is_fired(&self) -> bool {
        matches!(*lock(&self.state), EventState::Fired)
    }
}

/// Runs an action once `dec` has been called `count` times.
pub(crate) struct CountDownEvent {
    remaining: AtomicUsize,
    action: Mutex<Option<Listener>>,
}

impl CountDownEvent {
    pub fn new(count: usize, action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    pub fn dec(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let action = lock(&self.action).take();
            if let Some(action) = action {
                action();
            }
        }
    }
}

/// An action that runs on the first call to [`run`](Self::run) only.
pub struct RunOnce {
    action: Mutex<Option<Listener>>,
}

impl RunOnce {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    pub fn run(&self) {
        let action = lock(&self.action).take();
        if let Some(action) = action {
            action();
        }
    }
}

impl std::fmt::Debug for RunOnce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = lock(&self.action).is_some();
        f.debug_struct("RunOnce").field("pending", &pending).finish()
    }
}
