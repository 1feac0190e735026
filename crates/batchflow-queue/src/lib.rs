pub mod queue;
pub mod ready;

pub use queue::{BoundedQueue, QueueEnd};
pub use ready::ReadySlot;
