//! Gridlink Server: message routing and queued operation scheduling.
//!
//! [`GridServer`] is the transport's `MessageHandler`: it binds sessions as
//! connections authenticate, hands spreadsheet traffic to a
//! [`SpreadsheetProcessor`], fans updates out to subscribers, and settles
//! queued operations as tool responses come back.

pub mod operations;
pub mod processor;
pub mod router;

pub use operations::{OperationError, OperationRegistry, OperationStatus, QueuedOperation};
pub use processor::{ChatReply, InMemoryProcessor, ProcessorError, SpreadsheetProcessor};
pub use router::GridServer;
