//! Shuffle counters exported to the monitoring sink.
//!
//! All counters are plain atomics updated on the hot path and read at
//! finalize. Message counters (`nms`/`nmd`/`nmr`) are on the record domain:
//! a record forwarded through intermediate hops still counts once.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for one shuffle context.
#[derive(Debug, Default)]
pub struct ShuffleStats {
    /// Records shipped over the transport (counted at the origin).
    nms: AtomicU64,
    /// Records whose delivery has been acknowledged back to the origin.
    nmd: AtomicU64,
    /// Records received and handed to the delivery sink.
    nmr: AtomicU64,
    /// Batch RPC posts.
    nps: AtomicU64,
    /// Accumulated pending-send queue depth, sampled at each post.
    accqsz: AtomicU64,
    /// Largest per-outbox fill observed at flush, over the lifetime.
    maxqsz: AtomicU64,
    /// Smallest per-outbox fill observed at flush, over the lifetime.
    minqsz: AtomicU64,
}

impl ShuffleStats {
    pub fn new() -> Self {
        Self {
            minqsz: AtomicU64::new(u64::MAX),
            ..Default::default()
        }
    }

    pub fn record_sent(&self, records: u64) {
        self.nms.fetch_add(records, Ordering::Relaxed);
    }

    pub fn record_delivered_ack(&self, records: u64) {
        self.nmd.fetch_add(records, Ordering::Relaxed);
    }

    pub fn record_received(&self, records: u64) {
        self.nmr.fetch_add(records, Ordering::Relaxed);
    }

    /// Note one batch post with the pending-queue depth at post time and the
    /// batch fill in bytes.
    pub fn record_post(&self, queue_depth: u64, fill: u64) {
        self.nps.fetch_add(1, Ordering::Relaxed);
        self.accqsz.fetch_add(queue_depth, Ordering::Relaxed);
        self.maxqsz.fetch_max(fill, Ordering::Relaxed);
        self.minqsz.fetch_min(fill, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let minqsz = self.minqsz.load(Ordering::Relaxed);
        StatsSnapshot {
            nms: self.nms.load(Ordering::Relaxed),
            nmd: self.nmd.load(Ordering::Relaxed),
            nmr: self.nmr.load(Ordering::Relaxed),
            nps: self.nps.load(Ordering::Relaxed),
            accqsz: self.accqsz.load(Ordering::Relaxed),
            maxqsz: self.maxqsz.load(Ordering::Relaxed),
            minqsz: if minqsz == u64::MAX { 0 } else { minqsz },
        }
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub nms: u64,
    pub nmd: u64,
    pub nmr: u64,
    pub nps: u64,
    pub accqsz: u64,
    pub maxqsz: u64,
    pub minqsz: u64,
}

impl StatsSnapshot {
    /// Mean pending-queue depth per post, the number reported at finalize.
    pub fn mean_queue_depth(&self) -> f64 {
        if self.nps == 0 {
            0.0
        } else {
            self.accqsz as f64 / self.nps as f64
        }
    }
}
