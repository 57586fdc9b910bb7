//! Single-assignment futures.
//!
//! A [`Promise`] is the write side, a [`Future`] the read side of one slot.
//! The promise is consumed by the write, so a slot is written at most once.
//! Dropping an unwritten promise resolves the slot with
//! [`WorldError::BrokenPromise`] so readers are never left waiting on a
//! producer that no longer exists.
//!
//! Reads block the calling thread (not the process) until the slot is written.
//! Every read returns a clone of the same stored result.

use crate::error::{Result, WorldError};

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

struct Slot<T> {
    state: Mutex<Option<Result<T>>>,
    written: Condvar,
}

/// Read side of a single-assignment slot. Cloning shares the slot.
pub struct Future<T> {
    slot: Arc<Slot<T>>,
}

/// Write side of a single-assignment slot.
pub struct Promise<T> {
    slot: Option<Arc<Slot<T>>>,
}

/// Creates an unwritten slot.
pub fn pair<T>() -> (Promise<T>, Future<T>) {
    let slot = Arc::new(Slot {
        state: Mutex::new(None),
        written: Condvar::new(),
    });
    (
        Promise {
            slot: Some(slot.clone()),
        },
        Future { slot },
    )
}

impl<T> Promise<T> {
    pub fn set(mut self, value: T) {
        self.complete(Ok(value));
    }

    pub fn fail(mut self, err: WorldError) {
        self.complete(Err(err));
    }

    /// Writes either outcome.
    pub fn resolve(mut self, result: Result<T>) {
        self.complete(result);
    }

    fn complete(&mut self, result: Result<T>) {
        if let Some(slot) = self.slot.take() {
            let mut state = slot.state.lock();
            debug_assert!(state.is_none(), "future written twice");
            *state = Some(result);
            drop(state);
            slot.written.notify_all();
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.slot.is_some() {
            self.complete(Err(WorldError::BrokenPromise));
        }
    }
}

impl<T> Future<T> {
    /// An already-written future.
    pub fn ready(value: T) -> Self {
        Self::resolved(Ok(value))
    }

    /// An already-failed future.
    pub fn failed(err: WorldError) -> Self {
        Self::resolved(Err(err))
    }

    fn resolved(result: Result<T>) -> Self {
        Self {
            slot: Arc::new(Slot {
                state: Mutex::new(Some(result)),
                written: Condvar::new(),
            }),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.slot.state.lock().is_some()
    }
}

impl<T: Clone> Future<T> {
    /// Blocks until the slot is written and returns its value.
    pub fn get(&self) -> Result<T> {
        let mut state = self.slot.state.lock();
        loop {
            if let Some(result) = state.as_ref() {
                return result.clone();
            }
            self.slot.written.wait(&mut state);
        }
    }

    /// Returns the value if it is already written.
    pub fn try_get(&self) -> Option<Result<T>> {
        self.slot.state.lock().clone()
    }

    /// Like [`get`](Self::get) but gives up after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let mut state = self.slot.state.lock();
        if state.is_none() {
            self.slot.written.wait_while_for(&mut state, |s| s.is_none(), timeout);
        }
        state.clone()
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future")
            .field("ready", &self.is_ready())
            .finish()
    }
}
