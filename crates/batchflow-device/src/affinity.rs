use batchflow_core::CoreAssignment;

/// Total compute cores on one accelerator device.
pub const DEVICE_CORES: u32 = 32;

/// Core counts a single context may be bound to, largest first.
pub const VALID_CORE_COUNTS: [u32; 6] = [32, 16, 8, 4, 2, 1];

/// Largest valid core count that evenly divides `batch_size`.
///
/// Falls back to a single core when nothing divides (including a zero
/// batch).
pub fn core_count_for_batch(batch_size: usize) -> u32 {
    if batch_size == 0 {
        return 1;
    }
    VALID_CORE_COUNTS
        .iter()
        .copied()
        .find(|&c| batch_size % c as usize == 0)
        .unwrap_or(1)
}

/// Core assignment for the `worker_index`-th inference context.
///
/// Workers get contiguous, non-overlapping core ranges until the device
/// wraps around.
pub fn assign_cores(batch_size: usize, worker_index: usize) -> CoreAssignment {
    let core_count = core_count_for_batch(batch_size);
    let groups = (DEVICE_CORES / core_count) as usize;
    let start = (worker_index % groups) as u32 * core_count;
    let mask = if core_count >= 64 {
        u64::MAX
    } else {
        (1u64 << core_count) - 1
    };
    CoreAssignment {
        core_count,
        affinity: mask << start,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_count_prefers_largest_divisor() {
        assert_eq!(core_count_for_batch(64), 32);
        assert_eq!(core_count_for_batch(32), 32);
        assert_eq!(core_count_for_batch(8), 8);
        assert_eq!(core_count_for_batch(12), 4);
        assert_eq!(core_count_for_batch(6), 2);
    }

    #[test]
    fn test_core_count_defaults_to_one() {
        assert_eq!(core_count_for_batch(7), 1);
        assert_eq!(core_count_for_batch(1), 1);
        assert_eq!(core_count_for_batch(0), 1);
    }

    #[test]
    fn test_assignments_do_not_overlap_within_device() {
        let a = assign_cores(8, 0);
        let b = assign_cores(8, 1);
        assert_eq!(a.core_count, 8);
        assert_eq!(a.affinity, 0xff);
        assert_eq!(b.affinity, 0xff00);
        assert_eq!(a.affinity & b.affinity, 0);
        // Four groups of eight; the fifth worker wraps to the first group.
        assert_eq!(assign_cores(8, 4).affinity, a.affinity);
    }

    #[test]
    fn test_single_core_assignment() {
        let a = assign_cores(3, 5);
        assert_eq!(a.core_count, 1);
        assert_eq!(a.affinity, 1 << 5);
    }
}
