//! Errors surfaced by the hub facade.

use thiserror::Error;

use super::transport::TransportError;

#[derive(Debug, Error)]
pub enum HubError {
    /// The session does not exist or has been torn down.
    #[error("No session found for {0}")]
    SessionNotFound(String),

    #[error("host transport failed: {0}")]
    Transport(#[from] TransportError),
}
