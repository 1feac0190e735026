use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use batchflow_core::{FlowError, Result};

/// Which end of a [`BoundedQueue`] an operation applies to.
///
/// Stages push to the tail and pop from the head; the opposite end gives
/// LIFO behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEnd {
    Head,
    Tail,
}

/// Capacity-bounded, thread-safe double-ended queue.
///
/// Producers block while the queue is full and consumers block while it
/// is empty. Blocking waits on condition variables, so a waiter wakes as
/// soon as the operation that satisfies it completes. [`close`] wakes
/// every waiter: pushes are then rejected and pops drain what is left.
///
/// [`close`]: BoundedQueue::close
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

impl<T> Inner<T> {
    fn insert(&mut self, item: T, end: QueueEnd) {
        match end {
            QueueEnd::Head => self.items.push_front(item),
            QueueEnd::Tail => self.items.push_back(item),
        }
    }

    fn remove(&mut self, end: QueueEnd) -> Option<T> {
        match end {
            QueueEnd::Head => self.items.pop_front(),
            QueueEnd::Tail => self.items.pop_back(),
        }
    }
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                capacity,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// A queue whose pushes never block.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Push `item`, blocking while the queue is at capacity.
    pub fn push(&self, item: T, end: QueueEnd) -> Result<()> {
        self.offer(item, end).map_err(|_| FlowError::QueueClosed)
    }

    /// Like [`push`](Self::push), but hands the item back if the queue
    /// has been closed.
    pub fn offer(&self, item: T, end: QueueEnd) -> std::result::Result<(), T> {
        let mut inner = self.inner.lock();
        while !inner.closed && inner.items.len() >= inner.capacity {
            self.not_full.wait(&mut inner);
        }
        if inner.closed {
            return Err(item);
        }
        inner.insert(item, end);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Push every item in order, blocking as needed.
    pub fn push_n(&self, items: impl IntoIterator<Item = T>, end: QueueEnd) -> Result<()> {
        for item in items {
            self.push(item, end)?;
        }
        Ok(())
    }

    /// Pop one item, blocking while the queue is empty.
    pub fn pop(&self, end: QueueEnd) -> Result<T> {
        let mut inner = self.inner.lock();
        while !inner.closed && inner.items.is_empty() {
            self.not_empty.wait(&mut inner);
        }
        let item = inner.remove(end).ok_or(FlowError::QueueClosed)?;
        drop(inner);
        self.not_full.notify_one();
        Ok(item)
    }

    /// Pop one item if any is available, without blocking.
    pub fn try_pop(&self, end: QueueEnd) -> Option<T> {
        let item = self.inner.lock().remove(end)?;
        self.not_full.notify_one();
        Some(item)
    }

    /// Block for the first item, then take up to `n - 1` more that are
    /// already queued. Returns fewer than `n` items when the queue runs
    /// dry; that is a partial batch, not an error.
    pub fn pop_upto_n(&self, n: usize, end: QueueEnd) -> Result<Vec<T>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut inner = self.inner.lock();
        while !inner.closed && inner.items.is_empty() {
            self.not_empty.wait(&mut inner);
        }
        if inner.items.is_empty() {
            return Err(FlowError::QueueClosed);
        }
        let take = n.min(inner.items.len());
        let mut out = Vec::with_capacity(take);
        while out.len() < take {
            match inner.remove(end) {
                Some(item) => out.push(item),
                None => break,
            }
        }
        drop(inner);
        self.not_full.notify_all();
        Ok(out)
    }

    /// Pop exactly `n` items, blocking for each one in turn.
    pub fn force_pop_n(&self, n: usize, end: QueueEnd) -> Result<Vec<T>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.pop(end)?);
        }
        Ok(out)
    }

    pub fn size(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn full(&self) -> bool {
        let inner = self.inner.lock();
        inner.items.len() >= inner.capacity
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Drop every queued item.
    pub fn reset(&self) {
        let drained: Vec<T> = self.inner.lock().items.drain(..).collect();
        self.not_full.notify_all();
        // Item destructors may touch other queues; run them unlocked.
        drop(drained);
    }

    /// Change the capacity. Items beyond the new bound stay queued; later
    /// pushes block until the queue drains below it.
    pub fn resize(&self, capacity: usize) {
        self.inner.lock().capacity = capacity;
        self.not_full.notify_all();
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Remove and return everything currently queued.
    pub fn take_all(&self) -> Vec<T> {
        let drained: Vec<T> = self.inner.lock().items.drain(..).collect();
        self.not_full.notify_all();
        drained
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Snapshot of the item at position `i`; negative indices count from
    /// the tail.
    pub fn index(&self, i: isize) -> Option<T> {
        let inner = self.inner.lock();
        let len = inner.items.len() as isize;
        let pos = if i < 0 { len + i } else { i };
        if pos < 0 || pos >= len {
            return None;
        }
        inner.items.get(pos as usize).cloned()
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BoundedQueue")
            .field("len", &inner.items.len())
            .field("capacity", &inner.capacity)
            .field("closed", &inner.closed)
            .finish()
    }
}
