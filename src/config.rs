//! Runtime configuration for a shuffle context.
//!
//! All values have defaults matching the deployed system. The knobs the
//! launch environment controls are read from `SHUFFLE_*` variables by
//! [`ShuffleConfig::from_env`]; everything else is set programmatically by
//! the embedding layer.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, ShuffleError};
use crate::types::{Topology, MAX_FRAME_SIZE};

/// Tuning and mode parameters for a shuffle context.
#[derive(Debug, Clone)]
pub struct ShuffleConfig {
    /// Dispatch topology. `SHUFFLE_Use_3hop` selects [`Topology::ThreeHop`].
    pub topology: Topology,

    /// Skip the consistent-hash ring and place by `xxh32(name) % world`.
    pub bypass_placement: bool,

    /// Tokens per rank on the consistent-hash ring.
    pub virtual_factor: u32,

    /// Ring construction protocol. Only `"ring"` is implemented; anything
    /// else is a fatal configuration error at init.
    pub placement_protocol: String,

    /// Network prefix the transport should bind under. Informational to the
    /// QUIC adapter, which binds the injected address book.
    pub subnet: String,

    /// Transport protocol string, kept for operator visibility in logs.
    pub transport_proto: String,

    /// Root of the columnar log directory records are appended under. The
    /// send side strips this prefix from incoming paths; the receive side
    /// prepends its own copy before invoking the sink.
    pub plfsdir: PathBuf,

    /// Batch buffer capacity per outbox, in bytes.
    pub batch_cap: usize,

    /// In-flight batch sends per origin before `write` blocks.
    pub max_inflight: usize,

    /// Ceiling on outstanding RPCs accepted concurrently on the receive side.
    pub max_outstanding_rpcs: usize,

    /// Receive-side delivery queue budget, in bytes. Transports derive their
    /// inbound queue length from this and `batch_cap`.
    pub delivery_queue_bytes: usize,

    /// Background flusher wake period.
    pub flush_period: Duration,

    /// An outbox idle longer than this since its last append is flushed by
    /// the background flusher.
    pub flush_idle_age: Duration,

    /// Await each batch send at flush time instead of draining in bulk at
    /// the epoch boundary.
    pub force_sync: bool,

    /// Surround every epoch boundary with a world-wide barrier.
    pub paranoid_barrier: bool,

    /// Per-send timeout. Exceeding it is fatal.
    pub send_timeout: Duration,

    /// Test mode: append `[SEND]`/`[RECV]` lines to `trace_log`.
    pub testin: bool,

    /// Target file for the test-mode trace, if any.
    pub trace_log: Option<PathBuf>,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            topology: Topology::Direct,
            bypass_placement: false,
            virtual_factor: 1024,
            placement_protocol: "ring".into(),
            subnet: "127.0.0.1".into(),
            transport_proto: "bmi+tcp".into(),
            plfsdir: PathBuf::new(),
            batch_cap: 4096,
            max_inflight: 16,
            max_outstanding_rpcs: 256,
            delivery_queue_bytes: 32 << 10,
            flush_period: Duration::from_millis(10),
            flush_idle_age: Duration::from_millis(50),
            force_sync: false,
            paranoid_barrier: false,
            send_timeout: Duration::from_secs(60),
            testin: false,
            trace_log: None,
        }
    }
}

impl ShuffleConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `SHUFFLE_Use_3hop`
    /// - `SHUFFLE_Virtual_factor`
    /// - `SHUFFLE_Placement_protocol`
    /// - `SHUFFLE_Subnet`
    /// - `SHUFFLE_Mercury_proto`
    /// - `SHUFFLE_Bypass_placement`
    /// - `SHUFFLE_Force_sync`
    /// - `SHUFFLE_Paranoid_barrier`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if is_envset("SHUFFLE_Use_3hop") {
            cfg.topology = Topology::ThreeHop;
        }
        if let Ok(v) = std::env::var("SHUFFLE_Virtual_factor") {
            if let Ok(vf) = v.parse::<u32>() {
                cfg.virtual_factor = vf;
            }
        }
        if let Ok(v) = std::env::var("SHUFFLE_Placement_protocol") {
            if !v.is_empty() {
                cfg.placement_protocol = v;
            }
        }
        if let Ok(v) = std::env::var("SHUFFLE_Subnet") {
            if !v.is_empty() {
                cfg.subnet = v;
            }
        }
        if let Ok(v) = std::env::var("SHUFFLE_Mercury_proto") {
            if !v.is_empty() {
                cfg.transport_proto = v;
            }
        }
        cfg.bypass_placement = is_envset("SHUFFLE_Bypass_placement");
        cfg.force_sync = is_envset("SHUFFLE_Force_sync");
        cfg.paranoid_barrier = is_envset("SHUFFLE_Paranoid_barrier");

        cfg
    }

    /// Reject values the dispatchers cannot run with. Called once at init;
    /// a failure here aborts before any record is accepted.
    pub fn validate(&self) -> Result<()> {
        if self.virtual_factor == 0 {
            return Err(ShuffleError::Config("virtual factor must be >= 1".into()));
        }
        if self.placement_protocol != "ring" {
            return Err(ShuffleError::UnknownPlacementProtocol(
                self.placement_protocol.clone(),
            ));
        }
        if self.batch_cap < MAX_FRAME_SIZE {
            return Err(ShuffleError::Config(format!(
                "batch cap {} smaller than one frame ({MAX_FRAME_SIZE})",
                self.batch_cap
            )));
        }
        if self.max_inflight == 0 {
            return Err(ShuffleError::Config("max inflight must be >= 1".into()));
        }
        if self.testin && self.trace_log.is_none() {
            return Err(ShuffleError::Config(
                "test mode requires a trace log target".into(),
            ));
        }
        Ok(())
    }

    /// Inbound queue length a transport should use, in messages.
    pub fn delivery_queue_len(&self) -> usize {
        (self.delivery_queue_bytes / self.batch_cap).max(1)
    }
}

/// Environment truthiness: unset, empty, or `"0"` is false; anything else
/// is true.
pub fn is_envset(key: &str) -> bool {
    match std::env::var(key) {
        Ok(v) => !v.is_empty() && v != "0",
        Err(_) => false,
    }
}
