//! Error type shared by the client and server facades

use thiserror::Error;
use tftp::SectionId;

/// Failure of a facade operation
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to create TFTP handler: {0:#}")]
    HandlerCreation(anyhow::Error),

    #[error("failed to configure connection to {host}:{port}: {reason:#}")]
    Connection {
        host: String,
        port: u16,
        reason: anyhow::Error,
    },

    #[error("client is not connected")]
    NotConnected,

    #[error("server is already listening")]
    AlreadyListening,

    #[error("section {0} no longer exists")]
    SectionNotFound(SectionId),

    #[error("transfer of '{filename}' failed: {reason:#}")]
    Transfer { filename: String, reason: anyhow::Error },

    #[error("server failed while listening: {0:#}")]
    Listen(anyhow::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
