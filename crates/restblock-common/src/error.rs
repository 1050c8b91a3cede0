//! Error types for RestBlock
//!
//! One variant per failure class of the data path (transport, exchange,
//! range operations) plus the outcomes of the administrative operations.

use std::net::SocketAddr;

use thiserror::Error;

use crate::url::UrlError;

/// Common result type for RestBlock operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for RestBlock
#[derive(Debug, Error)]
pub enum Error {
    // Argument errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Connection errors
    #[error("not connected")]
    NotConnected,

    #[error("connection to {addr} failed: {source}")]
    ConnectFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("connection closed by peer")]
    PeerClosed,

    #[error("transfer interrupted")]
    Interrupted,

    #[error("incomplete transfer: {done} of {expected} bytes")]
    Incomplete { done: usize, expected: usize },

    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Remote errors
    #[error("remote object not found: {0}")]
    RemoteNotFound(String),

    #[error("remote error: {0}")]
    RemoteError(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    // Administrative errors
    #[error("already attached: {0}")]
    AlreadyAttached(String),

    #[error("device busy: {0}")]
    Busy(String),

    #[error("no such device: {0}")]
    NoSuchDevice(String),

    #[error("no such server: {0}")]
    NoSuchServer(String),

    #[error("no server available for {0}")]
    NoServerAvailable(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a remote error
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::RemoteError(msg.into())
    }

    /// Check if the peer dropped the connection under us
    #[must_use]
    pub const fn is_peer_closed(&self) -> bool {
        matches!(self, Self::PeerClosed)
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::RemoteNotFound(_) | Self::NoSuchDevice(_) | Self::NoSuchServer(_)
        )
    }

    /// Classic errno value for this error
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => 22, // EINVAL
            Self::NotConnected => 107,      // ENOTCONN
            Self::ConnectFailed { source, .. } => source.raw_os_error().unwrap_or(111),
            Self::PeerClosed => 32,  // EPIPE
            Self::Interrupted => 4,  // EINTR
            Self::Io(e) => e.raw_os_error().unwrap_or(5),
            Self::Incomplete { .. } | Self::RemoteError(_) => 5, // EIO
            Self::RemoteNotFound(_) => 19,                       // ENODEV
            Self::ResourceExhausted(_) => 12,                    // ENOMEM
            Self::AlreadyAttached(_) => 17,                      // EEXIST
            Self::Busy(_) => 16,                                 // EBUSY
            Self::NoSuchDevice(_) | Self::NoSuchServer(_) => 2,  // ENOENT
            Self::NoServerAvailable(_) => 6,                     // ENXIO
        }
    }
}

impl From<UrlError> for Error {
    fn from(e: UrlError) -> Self {
        Self::InvalidArgument(e.to_string())
    }
}
