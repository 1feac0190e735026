use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use batchflow_core::{clock, Accelerator, CompletionMarker, FlowError, PathEntry, Result};
use batchflow_device::BufferPool;
use batchflow_queue::{BoundedQueue, QueueEnd, ReadySlot};

use crate::batch::{InferenceResult, LoadedImage, PreparedBatch};
use crate::config::PipelineConfig;
use crate::geometry::FlowGeometry;
use crate::stats::{verify_identity, EpochReport, LatencySummary, ThroughputReport};

/// Published once by the first infer worker; everything downstream of the
/// path queue waits for it.
#[derive(Clone)]
pub struct Registration {
    pub accelerator: Arc<dyn Accelerator>,
    pub geometry: Arc<FlowGeometry>,
    pub input_pool: Arc<BufferPool>,
    pub output_pool: Arc<BufferPool>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("accelerator", &self.accelerator.name())
            .field("geometry", &self.geometry)
            .field("input_pool", &self.input_pool.id())
            .field("output_pool", &self.output_pool.id())
            .finish()
    }
}

/// Every queue connecting the stages.
pub struct FlowQueues {
    /// Epoch numbers for the source worker to emit.
    pub epochs: BoundedQueue<u32>,
    pub paths: BoundedQueue<PathEntry>,
    pub raw_images: BoundedQueue<LoadedImage>,
    pub batches: BoundedQueue<PreparedBatch>,
    pub results: BoundedQueue<InferenceResult>,
    pub completions: BoundedQueue<CompletionMarker>,
    pub preprocess_latency: BoundedQueue<u64>,
    pub infer_latency: BoundedQueue<u64>,
    pub postprocess_latency: BoundedQueue<u64>,
}

/// Instantaneous depth of every queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueueSizes {
    pub paths: usize,
    pub raw_images: usize,
    pub batches: usize,
    pub results: usize,
    pub completions: usize,
}

impl FlowQueues {
    fn new(config: &PipelineConfig) -> Self {
        let q = &config.queues;
        Self {
            epochs: BoundedQueue::unbounded(),
            paths: q.paths.map_or_else(BoundedQueue::unbounded, BoundedQueue::new),
            raw_images: BoundedQueue::new(q.raw_images),
            batches: BoundedQueue::new(q.batches),
            results: BoundedQueue::new(q.results),
            completions: BoundedQueue::unbounded(),
            preprocess_latency: BoundedQueue::unbounded(),
            infer_latency: BoundedQueue::unbounded(),
            postprocess_latency: BoundedQueue::unbounded(),
        }
    }

    pub fn sizes(&self) -> QueueSizes {
        QueueSizes {
            paths: self.paths.size(),
            raw_images: self.raw_images.size(),
            batches: self.batches.size(),
            results: self.results.size(),
            completions: self.completions.size(),
        }
    }

    fn close_all(&self) {
        self.epochs.close();
        self.paths.close();
        self.raw_images.close();
        self.batches.close();
        self.results.close();
        self.completions.close();
        self.preprocess_latency.close();
        self.infer_latency.close();
        self.postprocess_latency.close();
    }

    /// Drop everything still queued. In-flight batches return their sets
    /// to the pools as they are dropped.
    pub fn reset_all(&self) {
        self.epochs.reset();
        self.paths.reset();
        self.raw_images.reset();
        self.batches.reset();
        self.results.reset();
        self.completions.reset();
        self.preprocess_latency.reset();
        self.infer_latency.reset();
        self.postprocess_latency.reset();
    }
}

/// What the worker that completed an epoch must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochOutcome {
    /// Paths were queued again for another pass.
    Resubmitted,
    /// That was the last epoch.
    Final,
}

/// State shared by every worker of one flow.
pub struct FlowState {
    pub config: PipelineConfig,
    pub queues: FlowQueues,
    registration: ReadySlot<Registration>,
    canonical_claimed: AtomicBool,
    infer_index: AtomicUsize,
    paths: Mutex<Vec<PathBuf>>,
    submitted: AtomicU64,
    completed: AtomicU64,
    epochs_remaining: AtomicU32,
    epoch: AtomicU32,
    start_us: AtomicU64,
    shutdown: AtomicBool,
    error: Mutex<Option<FlowError>>,
    reports: Mutex<Vec<EpochReport>>,
    solo_latency_us: Mutex<Option<u64>>,
}

impl FlowState {
    pub fn new(config: PipelineConfig) -> Self {
        let queues = FlowQueues::new(&config);
        Self {
            config,
            queues,
            registration: ReadySlot::new(),
            canonical_claimed: AtomicBool::new(false),
            infer_index: AtomicUsize::new(0),
            paths: Mutex::new(Vec::new()),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            epochs_remaining: AtomicU32::new(0),
            epoch: AtomicU32::new(0),
            start_us: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            error: Mutex::new(None),
            reports: Mutex::new(Vec::new()),
            solo_latency_us: Mutex::new(None),
        }
    }

    /// Index for the next infer worker, used for core assignment.
    pub fn next_infer_index(&self) -> usize {
        self.infer_index.fetch_add(1, Ordering::AcqRel)
    }

    /// True for exactly one caller: the infer worker that owns pool
    /// creation and registration.
    pub fn claim_canonical(&self) -> bool {
        !self.canonical_claimed.swap(true, Ordering::AcqRel)
    }

    /// Publish the canonical model. Fails if the flow shut down first, in
    /// which case the caller still owns the pools.
    pub fn register(&self, registration: Registration) -> std::result::Result<(), Registration> {
        self.registration.set(registration)?;
        // A shutdown racing with registration must still close the pools.
        if self.is_shutdown() {
            self.close_pools();
        }
        Ok(())
    }

    /// Block until a model is registered. `None` if the flow shut down
    /// first.
    pub fn wait_registration(&self) -> Option<Registration> {
        self.registration.wait()
    }

    pub fn registration(&self) -> Option<Registration> {
        self.registration.get()
    }

    /// Record `paths` as the input list and queue the first epoch. A flow
    /// accepts one submission.
    pub fn submit(&self, paths: Vec<PathBuf>) -> Result<()> {
        if paths.is_empty() {
            return Err(FlowError::InvalidInput("no input paths submitted".into()));
        }
        if self.is_shutdown() {
            return Err(FlowError::Pipeline("flow is shut down".into()));
        }
        let mut list = self.paths.lock();
        if !list.is_empty() {
            return Err(FlowError::Pipeline("paths were already submitted".into()));
        }
        let count = paths.len() as u64;
        *list = paths;
        drop(list);

        self.submitted.store(count, Ordering::Release);
        self.completed.store(0, Ordering::Release);
        self.epochs_remaining
            .store(self.config.epochs, Ordering::Release);
        self.epoch.store(0, Ordering::Release);
        tracing::info!(images = count, epochs = self.config.epochs, "submitted input list");
        self.queues.epochs.push(0, QueueEnd::Tail)
    }

    /// Push every submitted path for `epoch`, stamping the epoch start.
    pub fn emit_epoch(&self, epoch: u32) -> Result<()> {
        let paths = self.paths.lock().clone();
        self.start_us.store(clock::now_us(), Ordering::Release);
        tracing::debug!(epoch, images = paths.len(), "emitting paths");
        self.queues.paths.push_n(
            paths
                .into_iter()
                .enumerate()
                .map(|(seq, path)| PathEntry::new(seq as u64, path)),
            QueueEnd::Tail,
        )
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    /// Completions recorded in the current epoch.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Count `n` completions whose markers are already queued. Returns
    /// true for the single call that brings the epoch to its total.
    pub fn record_completions(&self, n: u64) -> bool {
        let total = self.submitted();
        let before = self.completed.fetch_add(n, Ordering::AcqRel);
        total > 0 && before < total && before + n >= total
    }

    /// Report the finished epoch, reset the per-epoch queues and either
    /// queue the next pass or declare the run over.
    pub fn finish_epoch(&self) -> Result<EpochOutcome> {
        let epoch = self.epoch.load(Ordering::Acquire);
        let expected = self.submitted();
        let markers = self.queues.completions.take_all();
        verify_identity(&markers, expected)?;

        let report = EpochReport {
            epoch,
            throughput: ThroughputReport::from_markers(
                &markers,
                self.start_us.load(Ordering::Acquire),
            ),
            preprocess: LatencySummary::from_samples(self.queues.preprocess_latency.take_all()),
            infer: LatencySummary::from_samples(self.queues.infer_latency.take_all()),
            postprocess: LatencySummary::from_samples(self.queues.postprocess_latency.take_all()),
        };
        tracing::info!(
            epoch,
            images = report.throughput.images,
            elapsed_us = report.throughput.elapsed_us,
            qps = report.throughput.e2e_qps,
            steady_qps = ?report.throughput.steady_qps,
            infer_p50_us = report.infer.p50_us,
            "epoch complete"
        );
        tracing::debug!(epoch, sizes = ?self.queues.sizes(), "queue sizes at epoch end");
        self.reports.lock().push(report);

        let remaining = self.epochs_remaining.load(Ordering::Acquire).saturating_sub(1);
        self.epochs_remaining.store(remaining, Ordering::Release);
        if remaining == 0 {
            return Ok(EpochOutcome::Final);
        }
        self.completed.store(0, Ordering::Release);
        self.epoch.store(epoch + 1, Ordering::Release);
        self.queues.epochs.push(epoch + 1, QueueEnd::Tail)?;
        Ok(EpochOutcome::Resubmitted)
    }

    pub fn set_solo_latency(&self, us: u64) {
        *self.solo_latency_us.lock() = Some(us);
    }

    pub fn solo_latency(&self) -> Option<u64> {
        *self.solo_latency_us.lock()
    }

    pub fn reports(&self) -> Vec<EpochReport> {
        self.reports.lock().clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop every worker: close the registration slot, the pools and
    /// every queue, then drop in-flight work so its sets are returned.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("shutting down flow");
        self.registration.close();
        self.close_pools();
        self.queues.close_all();
        self.queues.batches.reset();
        self.queues.results.reset();
        self.queues.raw_images.reset();
        self.queues.paths.reset();
    }

    /// Record `err` as the reason the run failed and shut down. Only the
    /// first error is kept.
    pub fn cancel(&self, err: FlowError) {
        {
            let mut slot = self.error.lock();
            if slot.is_none() {
                tracing::error!(error = %err, "fatal error, cancelling flow");
                *slot = Some(err);
            } else {
                tracing::debug!(error = %err, "additional error after cancel");
            }
        }
        self.shutdown();
    }

    pub fn take_error(&self) -> Option<FlowError> {
        self.error.lock().take()
    }

    fn close_pools(&self) {
        if let Some(reg) = self.registration.get() {
            reg.input_pool.close();
            reg.output_pool.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(epochs: u32) -> FlowState {
        FlowState::new(PipelineConfig {
            epochs,
            ..PipelineConfig::default()
        })
    }

    #[test]
    fn test_submit_queues_first_epoch() {
        let s = state(1);
        s.submit(vec!["a.jpg".into(), "b.jpg".into()]).unwrap();
        assert_eq!(s.submitted(), 2);
        assert_eq!(s.queues.epochs.try_pop(QueueEnd::Head), Some(0));
        s.emit_epoch(0).unwrap();
        assert_eq!(s.queues.paths.size(), 2);
        assert_eq!(s.queues.paths.index(-1).unwrap().seq, 1);
        assert!(s.submit(vec!["c.jpg".into()]).is_err());
    }

    #[test]
    fn test_empty_submission_rejected() {
        assert!(matches!(state(1).submit(Vec::new()), Err(FlowError::InvalidInput(_))));
    }

    #[test]
    fn test_exactly_one_epoch_crossing() {
        let s = state(1);
        s.submit(vec!["a".into(), "b".into(), "c".into()]).unwrap();
        assert!(!s.record_completions(2));
        assert!(s.record_completions(1));
        assert!(!s.record_completions(1));
    }

    #[test]
    fn test_finish_epoch_resets_and_resubmits() {
        let s = state(2);
        s.submit(vec!["a".into(), "b".into()]).unwrap();
        s.queues.epochs.try_pop(QueueEnd::Head);
        for seq in 0..2 {
            s.queues
                .completions
                .push(CompletionMarker::new(seq, 100 + seq), QueueEnd::Tail)
                .unwrap();
            s.queues.infer_latency.push(10, QueueEnd::Tail).unwrap();
        }
        assert!(s.record_completions(2));

        assert_eq!(s.finish_epoch().unwrap(), EpochOutcome::Resubmitted);
        assert!(s.queues.completions.empty());
        assert!(s.queues.infer_latency.empty());
        assert_eq!(s.completed(), 0);
        assert_eq!(s.queues.epochs.try_pop(QueueEnd::Head), Some(1));

        for seq in 0..2 {
            s.queues
                .completions
                .push(CompletionMarker::new(seq, 200), QueueEnd::Tail)
                .unwrap();
        }
        assert!(s.record_completions(2));
        assert_eq!(s.finish_epoch().unwrap(), EpochOutcome::Final);

        let reports = s.reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].infer.count, 2);
        assert_eq!(reports[1].throughput.images, 2);
    }

    #[test]
    fn test_finish_epoch_rejects_missing_marker() {
        let s = state(1);
        s.submit(vec!["a".into(), "b".into()]).unwrap();
        s.queues
            .completions
            .push(CompletionMarker::new(0, 1), QueueEnd::Tail)
            .unwrap();
        s.queues
            .completions
            .push(CompletionMarker::new(0, 2), QueueEnd::Tail)
            .unwrap();
        assert!(matches!(s.finish_epoch(), Err(FlowError::Pipeline(_))));
    }

    #[test]
    fn test_cancel_keeps_first_error() {
        let s = state(1);
        s.cancel(FlowError::Device("first".into()));
        s.cancel(FlowError::Device("second".into()));
        assert!(s.is_shutdown());
        assert!(s.queues.paths.is_closed());
        assert!(s.wait_registration().is_none());
        match s.take_error() {
            Some(FlowError::Device(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
