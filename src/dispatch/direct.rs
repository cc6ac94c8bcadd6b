//! Flat dispatcher: one outbox per peer, batches posted straight to the
//! record's final destination.
//!
//! The write path stages an encoded frame and only produces a batch when
//! an outbox spills. A background flusher sweeps outboxes that have gone
//! idle so low-rate peers still see bounded latency. Epoch boundaries flush
//! everything and drain the pending sends in bulk.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{watch, Mutex};

use crate::config::ShuffleConfig;
use crate::dispatch::{await_submissions, Delivery, OutboxTable, PostOffice};
use crate::error::{Result, ShuffleError};
use crate::frame::{decode_batch, Frame};
use crate::placement::Placement;
use crate::stats::ShuffleStats;
use crate::transport::{RecvHandler, Transport};
use crate::types::{Epoch, Rank};

pub(crate) struct DirectDispatcher {
    rank: Rank,
    placement: Arc<Placement>,
    delivery: Arc<Delivery>,
    outboxes: Arc<OutboxTable>,
    office: Arc<PostOffice>,
    /// Held by the background flusher for the duration of each pass;
    /// `epoch_start` takes it to wait the flusher idle.
    flusher_gate: Arc<Mutex<()>>,
    flusher_stop: watch::Sender<bool>,
}

impl DirectDispatcher {
    pub fn new(
        cfg: &ShuffleConfig,
        transport: Arc<dyn Transport>,
        placement: Arc<Placement>,
        delivery: Arc<Delivery>,
        stats: Arc<ShuffleStats>,
    ) -> Arc<Self> {
        let rank = transport.local_rank();
        // The transport's post limit bounds our in-flight sends when it has
        // one; otherwise fall back to the configured RPC ceiling.
        let max_inflight = transport
            .limits()
            .max_post
            .unwrap_or(cfg.max_outstanding_rpcs);
        let office = PostOffice::new(
            Arc::clone(&transport),
            Arc::clone(&stats),
            max_inflight,
            cfg.force_sync,
        );
        let outboxes = Arc::new(OutboxTable::new(cfg.batch_cap));

        transport.register_receiver(Arc::new(DirectReceiver {
            rank,
            delivery: Arc::clone(&delivery),
            stats,
        }));

        let (stop_tx, stop_rx) = watch::channel(false);
        let gate = Arc::new(Mutex::new(()));
        tokio::spawn(flusher_loop(
            Arc::clone(&outboxes),
            Arc::clone(&office),
            Arc::clone(&gate),
            cfg.flush_period,
            cfg.flush_idle_age,
            stop_rx,
        ));

        Arc::new(Self {
            rank,
            placement,
            delivery,
            outboxes,
            office,
            flusher_gate: gate,
            flusher_stop: stop_tx,
        })
    }

    pub async fn write(&self, name: &str, payload: &[u8], epoch: Epoch) -> Result<()> {
        let dst = self.placement.destination(name.as_bytes());
        self.delivery
            .trace_send(name, payload, epoch, self.rank, dst);

        let frame = Frame {
            src: self.rank,
            dst,
            name: name.as_bytes(),
            payload,
            epoch,
        };

        if dst == self.rank {
            // Placement picked us: no network involvement at all.
            return self.delivery.deliver(&frame).await;
        }

        let mut buf = BytesMut::with_capacity(frame.wire_len());
        frame.encode_into(&mut buf)?;

        self.office.throttle().await;
        let mut submitted = None;
        self.outboxes
            .stage(dst, &buf, epoch, |b| submitted = self.office.enqueue(b));
        await_submissions(vec![submitted]).await
    }

    pub async fn epoch_start(&self, _epoch: Epoch) -> Result<()> {
        // Wait out any in-progress flusher pass.
        let _idle = self.flusher_gate.lock().await;
        Ok(())
    }

    pub async fn epoch_end(&self, _epoch: Epoch) -> Result<()> {
        self.flush_and_drain().await
    }

    pub async fn finalize(&self) -> Result<()> {
        let _ = self.flusher_stop.send(true);
        self.flush_and_drain().await
    }

    async fn flush_and_drain(&self) -> Result<()> {
        let mut submitted = Vec::new();
        self.outboxes
            .flush_all(|b| submitted.push(self.office.enqueue(b)));
        await_submissions(submitted).await?;
        self.office.drain().await;
        Ok(())
    }
}

async fn flusher_loop(
    outboxes: Arc<OutboxTable>,
    office: Arc<PostOffice>,
    gate: Arc<Mutex<()>>,
    period: Duration,
    idle_age: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = tick.tick() => {}
        }
        let _pass = gate.lock().await;
        let mut submitted = Vec::new();
        outboxes.flush_idle(idle_age, |b| submitted.push(office.enqueue(b)));
        if await_submissions(submitted).await.is_err() {
            return;
        }
    }
}

/// Receive side of the flat topology: every frame in a batch terminates
/// here, so the carrier's claimed source and our own rank must match the
/// frame exactly.
struct DirectReceiver {
    rank: Rank,
    delivery: Arc<Delivery>,
    stats: Arc<ShuffleStats>,
}

#[async_trait]
impl RecvHandler for DirectReceiver {
    async fn on_message(&self, src: Rank, dst: Rank, bytes: Bytes) -> Result<()> {
        for frame in decode_batch(&bytes) {
            let frame = frame?;
            if frame.src != src {
                return Err(ShuffleError::BadSrc {
                    claimed: frame.src,
                    carrier: src,
                });
            }
            if frame.dst != dst || frame.dst != self.rank {
                return Err(ShuffleError::BadDst {
                    claimed: frame.dst,
                    local: self.rank,
                });
            }
            self.stats.record_received(1);
            self.delivery.deliver(&frame).await?;
        }
        Ok(())
    }
}
