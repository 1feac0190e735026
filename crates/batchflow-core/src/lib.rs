pub mod clock;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{FlowError, Result};
pub use traits::{Accelerator, AcceleratorBackend, ImageLoader, LoadRequest};
pub use types::*;
