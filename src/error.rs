use std::io;

/// Which of the three memcached error lines a server replied with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    /// `ERROR`: the server did not recognise the command.
    Error,
    /// `CLIENT_ERROR <msg>`: the request was malformed or not applicable.
    ClientError,
    /// `SERVER_ERROR <msg>`: the server failed to carry out the request.
    ServerError,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },
    #[error("value of {size} bytes exceeds the {limit} byte limit")]
    ValueTooLarge { size: usize, limit: usize },
    #[error("network error: {0}")]
    Network(#[from] io::Error),
    #[error("timed out waiting for a pooled connection")]
    PoolTimeout,
    #[error("connection pool failure: {0}")]
    Pool(String),
    #[error("protocol error: unexpected response {0:?}")]
    Protocol(String),
    #[error("server replied {kind:?}: {message}")]
    Server {
        kind: ServerErrorKind,
        message: String,
    },
    #[error("no servers available")]
    NoServersAvailable,
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("compression failed: {0}")]
    Compression(io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn invalid_key(key: &str, reason: &'static str) -> Self {
        Error::InvalidKey {
            key: key.to_string(),
            reason,
        }
    }

    /// Bad key or oversized value, raised before any I/O.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::InvalidKey { .. } | Error::ValueTooLarge { .. })
    }

    /// Connect, read or write failure (including timeouts). The server that
    /// produced it gets marked dead.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    /// The operation could not reach any server, either because every
    /// candidate failed or because none was alive to begin with.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::PoolTimeout | Error::NoServersAvailable
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
