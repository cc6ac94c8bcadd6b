use crate::types::Rank;

pub type Result<T> = std::result::Result<T, ShuffleError>;

#[derive(Debug, thiserror::Error)]
pub enum ShuffleError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown placement protocol {0:?}")]
    UnknownPlacementProtocol(String),

    #[error("transport init failed: {message}")]
    TransportInit {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{field} too large for frame: {len} bytes (limit {limit})")]
    FrameTooLarge {
        field: &'static str,
        len: usize,
        limit: usize,
    },

    #[error("frame name must not be empty")]
    EmptyName,

    #[error("wire corruption: {0}")]
    WireCorruption(String),

    #[error("frame src {claimed} does not match carrier src {carrier}")]
    BadSrc { claimed: Rank, carrier: Rank },

    #[error("frame dst {claimed} does not match local rank {local}")]
    BadDst { claimed: Rank, local: Rank },

    #[error("delivery to {path:?} failed: {reason}")]
    Delivery { path: String, reason: String },

    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("send to rank {dst} timed out after {after_ms}ms")]
    SendTimeout { dst: Rank, after_ms: u64 },

    #[error("rank {rank} not in world of size {world_size}")]
    UnknownPeer { rank: Rank, world_size: u32 },

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShuffleError {
    /// Create a `Transport` error with just a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Transport` error with a message and a source error.
    pub fn transport_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a `TransportInit` error with just a message.
    pub fn transport_init(msg: impl Into<String>) -> Self {
        Self::TransportInit {
            message: msg.into(),
            source: None,
        }
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::WireCorruption(msg.into())
    }
}

/// Abort the process with a named message.
///
/// The shuffle core has no recovery path: any error past init would silently
/// lose simulation records, so workers that cannot propagate a `Result`
/// report the failure and abort, leaving the job scheduler an abnormal exit
/// to observe.
pub fn fatal(what: &str, err: &ShuffleError) -> ! {
    tracing::error!("!!!ABORT!!! {what}: {err}");
    eprintln!("!!!ABORT!!! {what}: {err}");
    std::process::abort();
}
