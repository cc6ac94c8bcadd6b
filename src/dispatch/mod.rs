//! Record dispatch: the two topologies behind one surface.
//!
//! A [`Dispatcher`] is a tagged variant over the common capability
//! (`write`, `epoch_start`, `epoch_end`, `finalize`); the topology is
//! picked at init and never changes. Shared plumbing lives here: the
//! [`PostOffice`] that ships batches, and the [`Delivery`] bridge that
//! turns a received frame into a sink write.

mod direct;
mod nexus;
mod outbox;
mod three_hop;

pub use nexus::Nexus;

pub(crate) use direct::DirectDispatcher;
pub(crate) use outbox::{Batch, OutboxTable};
pub(crate) use three_hop::ThreeHopDispatcher;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, Notify, Semaphore};

use crate::error::{fatal, Result, ShuffleError};
use crate::frame::Frame;
use crate::sink::{DeliverySink, TraceLog};
use crate::stats::ShuffleStats;
use crate::transport::Transport;
use crate::types::{Epoch, Rank};

/// The dispatch surface the shuffle context drives.
pub(crate) enum Dispatcher {
    Direct(Arc<DirectDispatcher>),
    ThreeHop(Arc<ThreeHopDispatcher>),
}

impl Dispatcher {
    pub async fn write(&self, name: &str, payload: &[u8], epoch: Epoch) -> Result<()> {
        match self {
            Dispatcher::Direct(d) => d.write(name, payload, epoch).await,
            Dispatcher::ThreeHop(d) => d.write(name, payload, epoch).await,
        }
    }

    pub async fn epoch_start(&self, epoch: Epoch) -> Result<()> {
        match self {
            Dispatcher::Direct(d) => d.epoch_start(epoch).await,
            Dispatcher::ThreeHop(d) => d.epoch_start(epoch).await,
        }
    }

    pub async fn epoch_end(&self, epoch: Epoch) -> Result<()> {
        match self {
            Dispatcher::Direct(d) => d.epoch_end(epoch).await,
            Dispatcher::ThreeHop(d) => d.epoch_end(epoch).await,
        }
    }

    pub async fn finalize(&self) -> Result<()> {
        match self {
            Dispatcher::Direct(d) => d.finalize().await,
            Dispatcher::ThreeHop(d) => d.finalize().await,
        }
    }
}

struct LaneItem {
    batch: Batch,
    /// Present when the submitter wants to await this batch (force_sync).
    done: Option<oneshot::Sender<()>>,
}

/// Send-side machinery shared by both dispatchers.
///
/// Each destination gets a lane: an unbounded queue drained by one worker
/// that posts a batch and awaits its delivery acknowledgement before
/// touching the next. Enqueue order per lane is therefore delivery order,
/// which is the per-(src, dst) FIFO the write path promises. Enqueue itself
/// is synchronous so the outbox table can call it under its lock.
///
/// Back-pressure: `throttle` parks writers while the number of batches not
/// yet acknowledged is at the cap. A global semaphore additionally bounds
/// how many lanes talk to the transport at once.
pub(crate) struct PostOffice {
    transport: Arc<dyn Transport>,
    stats: Arc<ShuffleStats>,
    lanes: Mutex<HashMap<Rank, mpsc::UnboundedSender<LaneItem>>>,
    inflight: Arc<Semaphore>,
    /// Batches enqueued and not yet acknowledged.
    outstanding: AtomicU64,
    cap: u64,
    idle: Notify,
    room: Notify,
    force_sync: bool,
}

impl PostOffice {
    pub fn new(
        transport: Arc<dyn Transport>,
        stats: Arc<ShuffleStats>,
        max_inflight: usize,
        force_sync: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            stats,
            lanes: Mutex::new(HashMap::new()),
            inflight: Arc::new(Semaphore::new(max_inflight)),
            outstanding: AtomicU64::new(0),
            cap: max_inflight as u64,
            idle: Notify::new(),
            room: Notify::new(),
            force_sync,
        })
    }

    /// Queue one batch on its destination lane. Never blocks. Returns a
    /// completion handle only in force_sync mode; the caller awaits it
    /// outside any lock.
    pub fn enqueue(self: &Arc<Self>, batch: Batch) -> Option<oneshot::Receiver<()>> {
        let dst = batch.dst;
        let depth = self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.stats.record_post(depth, batch.bytes.len() as u64);
        self.stats.record_sent(batch.frames);

        let (done, done_rx) = if self.force_sync {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let mut lanes = self.lanes.lock().expect("lane lock");
        let lane = lanes.entry(dst).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(lane_worker(Arc::clone(self), dst, rx));
            tx
        });
        if lane.send(LaneItem { batch, done }).is_err() {
            // The worker only exits when the lane sender is dropped, which
            // only happens when the office itself is dropped.
            unreachable!("lane worker gone while office alive");
        }
        done_rx
    }

    /// Park until there is room under the pending-send cap. The write path
    /// calls this before staging; this is where saturated transports push
    /// back on the simulation.
    ///
    /// Workers signal with `notify_one`, which stores a permit when nobody
    /// is parked yet, so a check-then-wait loop cannot miss a wakeup.
    pub async fn throttle(&self) {
        while self.outstanding.load(Ordering::Acquire) >= self.cap {
            self.room.notified().await;
        }
    }

    /// Wait until every queued batch has been delivered and acknowledged.
    pub async fn drain(&self) {
        while self.outstanding.load(Ordering::Acquire) != 0 {
            self.idle.notified().await;
        }
    }
}

async fn lane_worker(
    office: Arc<PostOffice>,
    dst: Rank,
    mut rx: mpsc::UnboundedReceiver<LaneItem>,
) {
    while let Some(item) = rx.recv().await {
        let permit = Arc::clone(&office.inflight)
            .acquire_owned()
            .await
            .expect("inflight semaphore closed");
        match office.transport.send_one_way(dst, item.batch.bytes).await {
            Ok(()) => office.stats.record_delivered_ack(item.batch.frames),
            Err(e) => fatal("shuffle send", &e),
        }
        drop(permit);
        if let Some(done) = item.done {
            let _ = done.send(());
        }
        if office.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            office.idle.notify_one();
        }
        office.room.notify_one();
    }
}

/// Await the completion handles force_sync submissions produced.
pub(crate) async fn await_submissions(handles: Vec<Option<oneshot::Receiver<()>>>) -> Result<()> {
    for rx in handles.into_iter().flatten() {
        rx.await
            .map_err(|_| ShuffleError::transport("send lane dropped a completion"))?;
    }
    Ok(())
}

/// Receive-side bridge: frame in, sink write out, trace lines on the way.
pub(crate) struct Delivery {
    pub plfsdir: String,
    pub sink: Arc<dyn DeliverySink>,
    pub trace: Option<Arc<TraceLog>>,
}

impl Delivery {
    pub fn path_for(&self, name: &str) -> String {
        format!("{}/{}", self.plfsdir, name)
    }

    /// Hand one frame to the sink. The caller has already established that
    /// this rank is the frame's final destination.
    pub async fn deliver(&self, frame: &Frame<'_>) -> Result<()> {
        let name = std::str::from_utf8(frame.name)
            .map_err(|_| ShuffleError::corruption("name is not utf-8"))?;
        let path = self.path_for(name);
        if let Some(trace) = &self.trace {
            trace.recv(&path, frame.payload, frame.epoch, frame.src, frame.dst);
        }
        self.sink.deliver(&path, frame.payload, frame.epoch).await
    }

    pub fn trace_send(&self, name: &str, payload: &[u8], epoch: Epoch, src: Rank, dst: Rank) {
        if let Some(trace) = &self.trace {
            trace.send(&self.path_for(name), payload, epoch, src, dst);
        }
    }
}
