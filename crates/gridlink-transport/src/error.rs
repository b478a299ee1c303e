use thiserror::Error;

/// Failures starting or running the transport server.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid listen address: {0}")]
    Address(#[from] std::net::AddrParseError),

    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
}
