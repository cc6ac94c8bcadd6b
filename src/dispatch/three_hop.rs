//! Hierarchical dispatcher: records cross node boundaries through
//! representatives, so a rank talks to its node peers plus one
//! representative per remote node instead of the whole world.
//!
//! The sender embeds the final destination in the frame and posts to
//! [`Nexus::next_hop`]. A representative receiving a batch splits it:
//! frames for this rank go to the sink, everything else is regrouped per
//! next hop and re-posted with the original `src` untouched. The forward
//! send is awaited before the upstream acknowledgement is released, so a
//! sender that has drained its own posts knows its records cleared every
//! hop — and successive batches on one lane cannot overtake each other
//! anywhere along the path.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::config::ShuffleConfig;
use crate::dispatch::{await_submissions, Delivery, Nexus, OutboxTable, PostOffice};
use crate::error::Result;
use crate::frame::{decode_batch, Frame};
use crate::placement::Placement;
use crate::stats::ShuffleStats;
use crate::transport::{RecvHandler, Transport};
use crate::types::{Epoch, Rank};

pub(crate) struct ThreeHopDispatcher {
    rank: Rank,
    nexus: Arc<Nexus>,
    placement: Arc<Placement>,
    delivery: Arc<Delivery>,
    outboxes: Arc<OutboxTable>,
    office: Arc<PostOffice>,
}

impl ThreeHopDispatcher {
    pub fn new(
        cfg: &ShuffleConfig,
        transport: Arc<dyn Transport>,
        nexus: Arc<Nexus>,
        placement: Arc<Placement>,
        delivery: Arc<Delivery>,
        stats: Arc<ShuffleStats>,
    ) -> Arc<Self> {
        let rank = transport.local_rank();
        let office = PostOffice::new(
            Arc::clone(&transport),
            Arc::clone(&stats),
            cfg.max_inflight,
            cfg.force_sync,
        );
        let outboxes = Arc::new(OutboxTable::new(cfg.batch_cap));

        transport.register_receiver(Arc::new(ThreeHopReceiver {
            rank,
            nexus: Arc::clone(&nexus),
            delivery: Arc::clone(&delivery),
            stats,
            transport: Arc::clone(&transport),
        }));

        Arc::new(Self {
            rank,
            nexus,
            placement,
            delivery,
            outboxes,
            office,
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
            return self.delivery.deliver(&frame).await;
        }

        let mut buf = BytesMut::with_capacity(frame.wire_len());
        frame.encode_into(&mut buf)?;
        let hop = self.nexus.next_hop(dst);

        self.office.throttle().await;
        let mut submitted = None;
        self.outboxes
            .stage(hop, &buf, epoch, |b| submitted = self.office.enqueue(b));
        await_submissions(vec![submitted]).await
    }

    pub async fn epoch_start(&self, _epoch: Epoch) -> Result<()> {
        Ok(())
    }

    /// Flush every hop queue and await the in-flight sends. Forwarding at
    /// the representatives acknowledges only after its own downstream send
    /// completed, so the drain here covers all three hops.
    pub async fn epoch_end(&self, _epoch: Epoch) -> Result<()> {
        self.flush_and_drain().await
    }

    pub async fn finalize(&self) -> Result<()> {
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

/// Receive side: terminal frames are delivered, transit frames are
/// regrouped by their next hop and re-posted in one batch per hop.
struct ThreeHopReceiver {
    rank: Rank,
    nexus: Arc<Nexus>,
    delivery: Arc<Delivery>,
    stats: Arc<ShuffleStats>,
    transport: Arc<dyn Transport>,
}

#[async_trait]
impl RecvHandler for ThreeHopReceiver {
    async fn on_message(&self, _src: Rank, dst: Rank, bytes: Bytes) -> Result<()> {
        debug_assert_eq!(dst, self.rank);
        let mut forwards: HashMap<Rank, BytesMut> = HashMap::new();

        for frame in decode_batch(&bytes) {
            let frame = frame?;
            if frame.dst == self.rank {
                self.stats.record_received(1);
                self.delivery.deliver(&frame).await?;
                continue;
            }
            // Transit frame: the carrier legitimately differs from the
            // frame's origin here, so only the routing is re-derived; the
            // frame itself travels untouched.
            let hop = self.nexus.next_hop(frame.dst);
            frame.encode_into(forwards.entry(hop).or_default())?;
        }

        for (hop, group) in forwards {
            self.transport.send_one_way(hop, group.freeze()).await?;
        }
        Ok(())
    }
}
