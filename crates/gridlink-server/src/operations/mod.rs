//! Queued operations: multi-step tool workflows with dependency ordering,
//! batching, cascade cancellation and undo/redo history.

mod registry;
mod types;

pub use registry::OperationRegistry;
pub use types::{Batch, BatchProgress, OperationError, OperationStatus, QueuedOperation};
