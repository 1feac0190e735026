pub mod affinity;
pub mod buffer;
pub mod host;
pub mod pool;

pub use affinity::{assign_cores, core_count_for_batch, DEVICE_CORES, VALID_CORE_COUNTS};
pub use buffer::{align_up, BufferRole, BufferSet, TENSOR_ALIGN};
pub use host::{FunctionDescriptor, HostAccelerator, HostBackend, ModelDescriptor};
pub use pool::{BufferPool, PoolStats, PooledSet, ReleaseError};
