//! Rank-to-rank record shuffle for columnar particle logs.
//!
//! Every record a simulation rank writes is owned by exactly one rank,
//! chosen by consistent hashing of the record's file name. This crate
//! frames records, batches them per destination, ships them over an
//! asynchronous one-way RPC transport, and appends them on the owner
//! through a pluggable delivery sink. Epoch boundaries drain everything in
//! flight so consumers see complete epochs.
//!
//! Two dispatch topologies share one surface: a flat one with an outbox per
//! peer, and a three-hop one that routes inter-node traffic through
//! per-node representatives.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod placement;
pub mod shuffle;
pub mod sink;
pub mod stats;
pub mod sync;
pub mod transport;
pub mod types;

pub use config::ShuffleConfig;
pub use dispatch::Nexus;
pub use error::{Result, ShuffleError};
pub use shuffle::Shuffle;
pub use sink::{DeliverySink, FsAppendSink, MemorySink, TraceLog};
pub use stats::StatsSnapshot;
pub use sync::SyncShuffle;
pub use transport::{BoundQuic, LocalTransport, QuicTransport, RecvHandler, Transport};
pub use types::{Epoch, Rank, Topology};
