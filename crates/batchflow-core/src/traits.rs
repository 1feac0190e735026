use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::types::{CoreAssignment, DeviceMemory, RawImage, TensorShape};

/// Parameters for loading one model function onto a device.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub model_path: PathBuf,
    pub function_name: String,
    pub device_id: u32,
    /// Independent inference streams processed per invocation.
    pub data_parallelism: usize,
}

/// Loads models onto an accelerator. Every call yields an independent
/// execution context; contexts from the same backend share device memory.
pub trait AcceleratorBackend: Send + Sync {
    fn load(&self, request: &LoadRequest) -> Result<Arc<dyn Accelerator>>;
}

/// A loaded model bound to one execution context.
///
/// All errors returned from this trait are fatal to the pipeline.
pub trait Accelerator: Send + Sync {
    /// Human-readable name for tracing.
    fn name(&self) -> &str;

    fn device_id(&self) -> u32;

    fn data_parallelism(&self) -> usize;

    fn input_shapes(&self) -> &[TensorShape];

    fn output_shapes(&self) -> &[TensorShape];

    /// Element count of every output tensor for one data-parallel stream.
    fn output_counts(&self) -> Vec<usize> {
        self.output_shapes().iter().map(TensorShape::count).collect()
    }

    /// Restrict this context to the given cores.
    fn apply_cores(&self, assignment: CoreAssignment) -> Result<()>;

    fn allocate(&self, bytes: usize) -> Result<DeviceMemory>;

    fn free(&self, memory: DeviceMemory) -> Result<()>;

    fn copy_host_to_device(&self, dst: &DeviceMemory, src: &[u8]) -> Result<()>;

    fn copy_device_to_host(&self, src: &DeviceMemory) -> Result<Vec<u8>>;

    /// Run the model synchronously, returning elapsed device time in
    /// microseconds.
    fn invoke(&self, inputs: &[DeviceMemory], outputs: &[DeviceMemory]) -> Result<u64>;
}

/// Decodes an input path into host pixels.
pub trait ImageLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<RawImage>;
}
