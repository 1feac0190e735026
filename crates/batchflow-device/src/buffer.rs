use batchflow_core::DeviceMemory;

/// Alignment applied to every per-stream tensor allocation (64 KiB).
pub const TENSOR_ALIGN: usize = 64 * 1024;

pub fn align_up(size: usize, align: usize) -> usize {
    size.div_ceil(align) * align
}

/// Which side of an invocation a pool's buffers serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRole {
    Input,
    Output,
}

impl std::fmt::Display for BufferRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferRole::Input => f.write_str("input"),
            BufferRole::Output => f.write_str("output"),
        }
    }
}

/// One device buffer per accelerator tensor, checked out of a
/// [`BufferPool`](crate::BufferPool) as a unit.
///
/// Move-only. The only way to obtain one is `BufferPool::acquire` and the
/// only way to give it back is `BufferPool::release`.
pub struct BufferSet {
    pool_id: u64,
    slot: usize,
    buffers: Vec<DeviceMemory>,
}

impl BufferSet {
    pub(crate) fn new(pool_id: u64, slot: usize, buffers: Vec<DeviceMemory>) -> Self {
        Self {
            pool_id,
            slot,
            buffers,
        }
    }

    pub(crate) fn into_buffers(self) -> Vec<DeviceMemory> {
        self.buffers
    }

    /// Pool this set belongs to.
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// Index of this set within its pool.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn buffers(&self) -> &[DeviceMemory] {
        &self.buffers
    }

    pub fn total_bytes(&self) -> usize {
        self.buffers.iter().map(DeviceMemory::bytes).sum()
    }
}

impl std::fmt::Debug for BufferSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<_> = self
            .buffers
            .iter()
            .map(|b| format!("0x{:x}", b.id()))
            .collect();
        f.debug_struct("BufferSet")
            .field("pool_id", &self.pool_id)
            .field("slot", &self.slot)
            .field("buffers", &ids)
            .field("total_bytes", &self.total_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, TENSOR_ALIGN), 0);
        assert_eq!(align_up(1, TENSOR_ALIGN), TENSOR_ALIGN);
        assert_eq!(align_up(TENSOR_ALIGN, TENSOR_ALIGN), TENSOR_ALIGN);
        assert_eq!(align_up(500 * 500 * 3, TENSOR_ALIGN), 12 * TENSOR_ALIGN);
    }
}
