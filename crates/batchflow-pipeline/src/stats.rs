use batchflow_core::{CompletionMarker, FlowError, Result};
use batchflow_device::PoolStats;
use serde::Serialize;

/// Images per second from `start_us` to `end_us`.
pub fn end_to_end_qps(count: u64, start_us: u64, end_us: u64) -> f64 {
    if end_us <= start_us {
        return 0.0;
    }
    count as f64 * 1e6 / (end_us - start_us) as f64
}

/// Images per second over the middle third of the completion timeline.
///
/// `timestamps` must be sorted ascending. Warm-up and cool-down sit
/// outside the `[k/3, 2k/3]` window. `None` when there are too few
/// completions or they all share one timestamp.
pub fn steady_qps(timestamps: &[u64]) -> Option<f64> {
    let k = timestamps.len();
    if k < 3 {
        return None;
    }
    let (i1, i2) = (k / 3, 2 * k / 3);
    let dt = timestamps[i2].checked_sub(timestamps[i1])?;
    if dt == 0 {
        return None;
    }
    Some((i2 - i1) as f64 * 1e6 / dt as f64)
}

/// Check that `markers` hold every sequence number `0..expected` exactly
/// once.
pub fn verify_identity(markers: &[CompletionMarker], expected: u64) -> Result<()> {
    let mut seqs: Vec<u64> = markers.iter().map(|m| m.seq).collect();
    seqs.sort_unstable();
    if seqs.len() as u64 != expected {
        return Err(FlowError::Pipeline(format!(
            "expected {expected} completions, got {}",
            seqs.len()
        )));
    }
    if let Some((pos, seq)) = seqs.iter().enumerate().find(|(i, s)| **s != *i as u64) {
        return Err(FlowError::Pipeline(format!(
            "completion {pos} carries sequence {seq}, inputs are missing or duplicated"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThroughputReport {
    pub images: u64,
    pub elapsed_us: u64,
    pub e2e_qps: f64,
    pub steady_qps: Option<f64>,
}

impl ThroughputReport {
    pub fn from_markers(markers: &[CompletionMarker], start_us: u64) -> Self {
        let mut times: Vec<u64> = markers.iter().map(|m| m.at_us).collect();
        times.sort_unstable();
        let end_us = times.last().copied().unwrap_or(start_us);
        let images = markers.iter().map(|m| m.weight as u64).sum();
        Self {
            images,
            elapsed_us: end_us.saturating_sub(start_us),
            e2e_qps: end_to_end_qps(images, start_us, end_us),
            steady_qps: steady_qps(&times),
        }
    }
}

/// Latency distribution of one stage over an epoch, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

impl LatencySummary {
    pub fn from_samples(mut samples: Vec<u64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_unstable();
        let n = samples.len();
        let pct = |p: f64| samples[((n - 1) as f64 * p).round() as usize];
        Self {
            count: n,
            mean_us: samples.iter().sum::<u64>() as f64 / n as f64,
            p50_us: pct(0.50),
            p99_us: pct(0.99),
            max_us: samples[n - 1],
        }
    }
}

/// Measurements for one pass over the submitted paths.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochReport {
    pub epoch: u32,
    pub throughput: ThroughputReport,
    pub preprocess: LatencySummary,
    pub infer: LatencySummary,
    pub postprocess: LatencySummary,
}

/// Everything a finished run measured.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub epochs: Vec<EpochReport>,
    /// One invocation timed with nothing else in flight, after the last
    /// epoch.
    pub solo_latency_us: Option<u64>,
    pub input_pool: Option<PoolStatsReport>,
    pub output_pool: Option<PoolStatsReport>,
}

/// Serializable mirror of [`PoolStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatsReport {
    pub slot_count: usize,
    pub high_water: usize,
    pub acquired_total: u64,
    pub released_total: u64,
    pub balanced: bool,
}

impl From<PoolStats> for PoolStatsReport {
    fn from(s: PoolStats) -> Self {
        Self {
            slot_count: s.slot_count,
            high_water: s.high_water,
            acquired_total: s.acquired_total,
            released_total: s.released_total,
            balanced: s.is_balanced(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(k: u64, start: u64, l: u64) -> Vec<CompletionMarker> {
        (0..k)
            .map(|i| CompletionMarker::new(i, start + (i + 1) * l))
            .collect()
    }

    #[test]
    fn test_uniform_timeline_qps_match() {
        let l = 250;
        let markers = uniform(9000, 1_000, l);
        let report = ThroughputReport::from_markers(&markers, 1_000);
        let expected = 1e6 / l as f64;
        assert_eq!(report.images, 9000);
        assert!((report.e2e_qps - expected).abs() < 1e-6);
        assert!((report.steady_qps.unwrap() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_steady_window_ignores_warmup() {
        // Slow first third, fast middle.
        let mut times: Vec<u64> = (0..30).map(|i| i * 1000).collect();
        times.extend((0..60).map(|i| 30_000 + i * 100));
        let qps = steady_qps(&times).unwrap();
        assert!((qps - 10_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_steady_needs_spread() {
        assert_eq!(steady_qps(&[1, 2]), None);
        assert_eq!(steady_qps(&[5, 5, 5, 5]), None);
    }

    #[test]
    fn test_identity_detects_duplicates() {
        let mut markers = uniform(4, 0, 1);
        verify_identity(&markers, 4).unwrap();
        markers[3].seq = 1;
        assert!(verify_identity(&markers, 4).is_err());
        assert!(verify_identity(&markers[..3], 4).is_err());
    }

    #[test]
    fn test_latency_summary() {
        let s = LatencySummary::from_samples((1..=100).collect());
        assert_eq!(s.count, 100);
        assert_eq!(s.mean_us, 50.5);
        assert_eq!(s.p50_us, 51);
        assert_eq!(s.p99_us, 99);
        assert_eq!(s.max_us, 100);
        assert_eq!(LatencySummary::from_samples(Vec::new()), LatencySummary::default());
    }
}
