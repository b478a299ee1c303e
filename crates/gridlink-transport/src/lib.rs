//! Gridlink Transport Layer
//!
//! Provides the WebSocket transport and the connection hub.
//! The transport layer handles:
//! - Connection lifecycle (upgrade, inbound/outbound loops, teardown)
//! - Authentication gate
//! - Heartbeat / stale connection detection
//! - Broadcast and send-to-one through the hub's dispatch loop
//!
//! The transport is decoupled from message semantics via the `MessageHandler` trait.

pub mod connection;
pub mod error;
pub mod handler;
pub mod hub;
pub mod server;

pub use connection::Connection;
pub use error::TransportError;
pub use handler::{MessageContext, MessageHandler};
pub use hub::{ConnectionFilter, Hub, HubHandle};
pub use server::{TransportConfig, TransportServer};
