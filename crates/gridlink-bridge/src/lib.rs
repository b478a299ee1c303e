//! Gridlink Bridge: addressing sessions and correlating tool calls.
//!
//! A backend caller never talks to a connection directly. It names a
//! session; the [`SessionDirectory`] says whether that session is reachable
//! by direct push through the hub or only through the HTTP relay; the
//! [`RequestCorrelator`] pairs every outbound `tool_request` with the
//! response that eventually comes back. [`ToolDispatcher`] ties the three
//! together.

pub mod correlator;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod relay;

pub use correlator::{Correlation, PendingResponse, RequestCorrelator};
pub use directory::{Recipient, Session, SessionDirectory};
pub use dispatcher::{BridgeConfig, DeliveryOutcome, ToolDispatcher};
pub use error::BridgeError;
pub use relay::RelayClient;
