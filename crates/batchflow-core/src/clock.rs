use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic timestamp in microseconds since the first call in this process.
pub fn now_us() -> u64 {
    let base = EPOCH.get_or_init(Instant::now);
    base.elapsed().as_micros() as u64
}
