use parking_lot::{Condvar, Mutex};

/// A slot that is filled at most once and awaited by any number of
/// threads.
///
/// Dependent stages call [`wait`](ReadySlot::wait) exactly once at startup
/// instead of polling for the producer.
pub struct ReadySlot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

struct SlotState<T> {
    value: Option<T>,
    closed: bool,
}

impl<T: Clone> ReadySlot<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                value: None,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Fill the slot. Returns the value back if the slot was already
    /// filled or closed.
    pub fn set(&self, value: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.value.is_some() || state.closed {
            return Err(value);
        }
        state.value = Some(value);
        drop(state);
        self.ready.notify_all();
        Ok(())
    }

    /// Block until the slot is filled. Returns `None` if it was closed
    /// before a value arrived.
    pub fn wait(&self) -> Option<T> {
        let mut state = self.state.lock();
        while state.value.is_none() && !state.closed {
            self.ready.wait(&mut state);
        }
        state.value.clone()
    }

    pub fn get(&self) -> Option<T> {
        self.state.lock().value.clone()
    }

    /// Release every waiter. A slot filled before closing keeps its value.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }
}

impl<T: Clone> Default for ReadySlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
