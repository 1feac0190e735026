use batchflow_core::{HostImage, PathEntry, RawImage};
use batchflow_device::PooledSet;

/// A decoded image waiting for preprocessing.
#[derive(Debug)]
pub struct LoadedImage {
    pub entry: PathEntry,
    pub image: RawImage,
}

/// Host images plus the device sets they were staged into.
///
/// `input` already holds the packed batch; `output` is untouched until
/// the batch is invoked. Both sets go back to their pools when the batch
/// is dropped.
#[derive(Debug)]
pub struct PreparedBatch {
    pub images: Vec<HostImage>,
    pub input: PooledSet,
    pub output: PooledSet,
}

impl PreparedBatch {
    /// Real (non-padding) images in this batch.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// A batch whose output set has been written by the accelerator.
#[derive(Debug)]
pub struct InferenceResult {
    pub batch: PreparedBatch,
    /// Device time reported by the invocation.
    pub device_us: u64,
}
