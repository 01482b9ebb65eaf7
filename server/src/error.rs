//! Error types for the TopPet server.
//!
//! Each module owns the errors of its concern:
//!
//! - [`ConfigError`] - configuration loading and validation
//! - [`AuthError`](crate::auth::AuthError) - viewer tokens and publisher signatures
//! - [`ChatError`](crate::chat::ChatError) - refused chat posts
//!
//! [`ServerError`] is the top-level error returned by the binary's startup
//! and serve path.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

pub use crate::config::ConfigError;

/// Top-level error type for the TopPet server process.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The listener could not be bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The HTTP server stopped with an I/O error.
    #[error("server error: {0}")]
    Serve(#[source] io::Error),
}

impl ServerError {
    pub fn bind(address: SocketAddr, source: io::Error) -> Self {
        Self::Bind { address, source }
    }
}

/// Result alias for server startup and serving.
pub type Result<T, E = ServerError> = std::result::Result<T, E>;
