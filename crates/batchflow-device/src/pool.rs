use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use batchflow_core::{Accelerator, DeviceMemory, FlowError, Result};
use batchflow_queue::{BoundedQueue, QueueEnd};

use crate::buffer::{BufferRole, BufferSet};

static POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Fixed-size pool of pre-allocated device buffer sets.
///
/// Every set is allocated up front; steady-state operation only moves
/// sets between the free list and their current holder, so the device
/// allocator is never touched while batches are in flight. The free list
/// is a [`BoundedQueue`], so `acquire` blocks exactly like a queue pop.
pub struct BufferPool {
    id: u64,
    role: BufferRole,
    accelerator: Arc<dyn Accelerator>,
    free: BoundedQueue<BufferSet>,
    slot_count: usize,
    sizes: Vec<usize>,
    outstanding: AtomicUsize,
    high_water: AtomicUsize,
    acquired_total: AtomicU64,
    released_total: AtomicU64,
}

/// Point-in-time balance counters of a [`BufferPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub slot_count: usize,
    pub free: usize,
    pub outstanding: usize,
    pub high_water: usize,
    pub acquired_total: u64,
    pub released_total: u64,
}

impl PoolStats {
    /// Every acquire has been matched by a release.
    pub fn is_balanced(&self) -> bool {
        self.outstanding == 0 && self.acquired_total == self.released_total
    }
}

impl BufferPool {
    /// Allocate `slot_count` sets, each holding one buffer per entry of
    /// `sizes`. Any allocation failure frees what was already allocated
    /// and is returned as a fatal device error.
    pub fn new(
        accelerator: Arc<dyn Accelerator>,
        role: BufferRole,
        slot_count: usize,
        sizes: Vec<usize>,
    ) -> Result<Self> {
        if slot_count == 0 {
            return Err(FlowError::Config("buffer pool needs at least one slot".into()));
        }
        let id = POOL_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let free: BoundedQueue<BufferSet> = BoundedQueue::new(slot_count);

        for slot in 0..slot_count {
            let mut buffers = Vec::with_capacity(sizes.len());
            for &bytes in &sizes {
                match accelerator.allocate(bytes) {
                    Ok(mem) => buffers.push(mem),
                    Err(e) => {
                        tracing::error!(pool_id = id, %role, slot, bytes, error = %e, "buffer allocation failed");
                        free_all(accelerator.as_ref(), buffers);
                        for set in free.take_all() {
                            free_all(accelerator.as_ref(), set.into_buffers());
                        }
                        return Err(e);
                    }
                }
            }
            free.push(BufferSet::new(id, slot, buffers), QueueEnd::Tail)?;
        }

        tracing::debug!(
            pool_id = id,
            %role,
            slots = slot_count,
            set_bytes = sizes.iter().sum::<usize>(),
            "allocated buffer pool"
        );

        Ok(Self {
            id,
            role,
            accelerator,
            free,
            slot_count,
            sizes,
            outstanding: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            acquired_total: AtomicU64::new(0),
            released_total: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> BufferRole {
        self.role
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Byte size of each buffer in a set.
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Number of sets currently checked out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Number of sets currently free.
    pub fn available(&self) -> usize {
        self.free.size()
    }

    /// Take a set, blocking while none is free. Fails with
    /// [`FlowError::QueueClosed`] once the pool is closed.
    pub fn acquire(&self) -> Result<BufferSet> {
        let set = self.free.pop(QueueEnd::Head)?;
        self.on_acquired(&set);
        Ok(set)
    }

    /// Take a set wrapped in a guard that returns it on drop.
    pub fn lease(self: &Arc<Self>) -> Result<PooledSet> {
        let set = self.acquire()?;
        Ok(PooledSet {
            set: Some(set),
            pool: Arc::clone(self),
        })
    }

    fn on_acquired(&self, set: &BufferSet) {
        let now = self.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        self.high_water.fetch_max(now, Ordering::AcqRel);
        self.acquired_total.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(pool_id = self.id, role = %self.role, slot = set.slot(), outstanding = now, "acquired buffer set");
    }

    /// Return a set to the pool.
    ///
    /// A set from another pool, or one this pool has no record of issuing,
    /// is handed back inside the error untouched so its owner can still
    /// take it. After [`close`](Self::close) the set's memory is freed
    /// instead of being queued for reuse.
    pub fn release(&self, set: BufferSet) -> std::result::Result<(), ReleaseError> {
        if set.pool_id() != self.id {
            let error = FlowError::PoolImbalance(format!(
                "{} set from pool {} returned to pool {}",
                self.role,
                set.pool_id(),
                self.id
            ));
            return Err(ReleaseError::rejected(error, set));
        }
        // Decrement before the set is visible to acquirers so `outstanding`
        // never exceeds `slot_count`.
        if self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            let error = FlowError::PoolImbalance(format!(
                "{} pool {} released more sets than it issued",
                self.role, self.id
            ));
            return Err(ReleaseError::rejected(error, set));
        }
        self.released_total.fetch_add(1, Ordering::Relaxed);

        let slot = set.slot();
        if let Err(set) = self.free.offer(set, QueueEnd::Tail) {
            tracing::debug!(pool_id = self.id, role = %self.role, slot, "pool closed, freeing returned set");
            return free_set(self.accelerator.as_ref(), set).map_err(ReleaseError::from);
        }
        tracing::trace!(pool_id = self.id, role = %self.role, slot, "released buffer set");
        Ok(())
    }

    /// Wake every blocked `acquire`. Sets released afterwards are freed.
    pub fn close(&self) {
        self.free.close();
    }

    /// Free every allocation. Fails with [`FlowError::PoolImbalance`] if
    /// any set is still checked out.
    pub fn destroy(&self) -> Result<()> {
        let outstanding = self.outstanding();
        if outstanding != 0 {
            return Err(FlowError::PoolImbalance(format!(
                "{} pool {} destroyed with {outstanding} sets outstanding",
                self.role, self.id
            )));
        }
        self.free.close();
        let mut first_err = None;
        let mut freed = 0usize;
        for set in self.free.take_all() {
            freed += 1;
            if let Err(e) = free_set(self.accelerator.as_ref(), set) {
                first_err.get_or_insert(e);
            }
        }
        tracing::debug!(pool_id = self.id, role = %self.role, freed, "destroyed buffer pool");
        first_err.map_or(Ok(()), Err)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            slot_count: self.slot_count,
            free: self.free.size(),
            outstanding: self.outstanding(),
            high_water: self.high_water.load(Ordering::Acquire),
            acquired_total: self.acquired_total.load(Ordering::Relaxed),
            released_total: self.released_total.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("sizes", &self.sizes)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Failure to return a set to a [`BufferPool`].
#[derive(Debug)]
pub struct ReleaseError {
    pub error: FlowError,
    /// The set, when the pool refused it rather than failing to free it.
    pub set: Option<BufferSet>,
}

impl ReleaseError {
    fn rejected(error: FlowError, set: BufferSet) -> Self {
        Self {
            error,
            set: Some(set),
        }
    }
}

impl From<FlowError> for ReleaseError {
    fn from(error: FlowError) -> Self {
        Self { error, set: None }
    }
}

impl From<ReleaseError> for FlowError {
    fn from(e: ReleaseError) -> Self {
        e.error
    }
}

impl std::fmt::Display for ReleaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.error, f)
    }
}

impl std::error::Error for ReleaseError {}

fn free_set(accelerator: &dyn Accelerator, set: BufferSet) -> Result<()> {
    let mut first_err = None;
    for mem in set.into_buffers() {
        if let Err(e) = accelerator.free(mem) {
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

fn free_all(accelerator: &dyn Accelerator, buffers: Vec<DeviceMemory>) {
    for mem in buffers {
        if let Err(e) = accelerator.free(mem) {
            tracing::error!(error = %e, "failed to free buffer during pool unwind");
        }
    }
}

/// A checked-out [`BufferSet`] that returns itself to its pool on drop.
///
/// Holding sets through this guard makes the acquire/release balance
/// structural: every path out of a worker, including early returns on
/// error and items dropped from a closed queue, gives the set back.
pub struct PooledSet {
    set: Option<BufferSet>,
    pool: Arc<BufferPool>,
}

impl PooledSet {
    pub fn buffers(&self) -> &[DeviceMemory] {
        match &self.set {
            Some(set) => set.buffers(),
            None => &[],
        }
    }

    pub fn slot(&self) -> Option<usize> {
        self.set.as_ref().map(BufferSet::slot)
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Return the set now, surfacing any release error.
    pub fn release(mut self) -> Result<()> {
        match self.set.take() {
            Some(set) => self.pool.release(set).map_err(FlowError::from),
            None => Ok(()),
        }
    }
}

impl Drop for PooledSet {
    fn drop(&mut self) {
        if let Some(set) = self.set.take() {
            if let Err(e) = self.pool.release(set) {
                tracing::error!(pool_id = self.pool.id(), error = %e, "failed to return buffer set");
            }
        }
    }
}

impl std::fmt::Debug for PooledSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSet")
            .field("pool_id", &self.pool.id())
            .field("set", &self.set)
            .finish()
    }
}
