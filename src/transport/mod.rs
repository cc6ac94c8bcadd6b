//! Transport seam between the dispatchers and the RPC layer.
//!
//! The dispatchers only ever see these two traits, so the RPC library is
//! swappable: [`LocalTransport`] is an in-process mesh used by tests and
//! single-node runs, [`QuicTransport`] is the networked implementation.

mod local;
mod quic;
pub(crate) mod tls;

pub use local::LocalTransport;
pub use quic::{BoundQuic, QuicTransport};

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::types::Rank;

/// Asynchronous one-way RPC between ranks.
///
/// `send_one_way` resolves once the destination's receive handler has run to
/// completion for the message — a delivery acknowledgement, not just a
/// network send. Draining every pending send future therefore implies every
/// shipped record has reached its sink, which is what the epoch coordinator
/// relies on.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_rank(&self) -> Rank;

    fn world_size(&self) -> u32;

    /// Deliver `bytes` to `dst` exactly once. Resolves on delivery
    /// acknowledgement; any transport failure or timeout is an error.
    async fn send_one_way(&self, dst: Rank, bytes: Bytes) -> Result<()>;

    /// Install the receive handler. Messages arriving before registration
    /// are parked by the transport, not dropped.
    fn register_receiver(&self, handler: Arc<dyn RecvHandler>);

    /// World-wide barrier across all ranks of this transport's world.
    async fn barrier(&self) -> Result<()>;

    /// Concurrency bounds the transport asks its users to respect.
    fn limits(&self) -> TransportLimits;

    /// Tear down: drop the receive handler and refuse further traffic.
    async fn shutdown(&self) -> Result<()>;
}

/// Receive side of the one-way RPC. Invoked once per message, possibly from
/// several transport progress tasks at once.
#[async_trait]
pub trait RecvHandler: Send + Sync {
    /// `src` and `dst` are the carrier's claim of origin and destination;
    /// the handler cross-checks them against the frames inside `bytes`.
    async fn on_message(&self, src: Rank, dst: Rank, bytes: Bytes) -> Result<()>;
}

/// Concurrency bounds advertised by a transport.
#[derive(Debug, Clone, Copy)]
pub struct TransportLimits {
    /// Maximum sends a single origin should keep in flight, when the
    /// transport has an opinion.
    pub max_post: Option<usize>,
    /// Messages the receive side will process concurrently.
    pub recv_concurrency: usize,
}
