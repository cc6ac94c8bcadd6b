//! In-process transport: every rank of the world lives in one process and
//! messages travel over bounded tokio channels.
//!
//! This is the substitutable test double the dispatchers are written
//! against, and it is also what a world of one rank runs on. Delivery
//! acknowledgements are oneshot channels resolved after the destination's
//! receive handler returns, so `send_one_way` has the same completion
//! meaning as the networked transport.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch, Barrier, Semaphore};

use crate::config::ShuffleConfig;
use crate::error::{fatal, Result, ShuffleError};
use crate::transport::{RecvHandler, Transport, TransportLimits};
use crate::types::Rank;

struct Envelope {
    src: Rank,
    bytes: Bytes,
    ack: oneshot::Sender<()>,
}

type HandlerSlot = watch::Sender<Option<Arc<dyn RecvHandler>>>;

/// One rank's endpoint of an in-process world.
pub struct LocalTransport {
    rank: Rank,
    world_size: u32,
    inboxes: Vec<mpsc::Sender<Envelope>>,
    handler: HandlerSlot,
    barrier: Arc<Barrier>,
    send_timeout: std::time::Duration,
    recv_concurrency: usize,
}

impl LocalTransport {
    /// Build a fully-connected world of `world_size` ranks, returned in
    /// rank order. All endpoints share one barrier and one channel mesh.
    pub fn world(world_size: u32, cfg: &ShuffleConfig) -> Vec<Arc<LocalTransport>> {
        assert!(world_size > 0, "world size must be >= 1");
        let queue_len = cfg.delivery_queue_len();
        let barrier = Arc::new(Barrier::new(world_size as usize));

        let mut senders = Vec::with_capacity(world_size as usize);
        let mut receivers = Vec::with_capacity(world_size as usize);
        for _ in 0..world_size {
            let (tx, rx) = mpsc::channel::<Envelope>(queue_len);
            senders.push(tx);
            receivers.push(rx);
        }

        let mut endpoints = Vec::with_capacity(world_size as usize);
        for (rank, rx) in receivers.into_iter().enumerate() {
            let (handler_tx, handler_rx) = watch::channel(None);
            let endpoint = Arc::new(LocalTransport {
                rank: rank as Rank,
                world_size,
                inboxes: senders.clone(),
                handler: handler_tx,
                barrier: Arc::clone(&barrier),
                send_timeout: cfg.send_timeout,
                recv_concurrency: cfg.max_outstanding_rpcs,
            });
            tokio::spawn(recv_loop(
                rank as Rank,
                rx,
                handler_rx,
                cfg.max_outstanding_rpcs,
            ));
            endpoints.push(endpoint);
        }
        endpoints
    }
}

/// Drain one rank's inbox, running the handler for each message on its own
/// task so a handler that re-posts (three-hop forwarding) cannot stall the
/// loop. Concurrency is bounded by a semaphore.
async fn recv_loop(
    rank: Rank,
    mut rx: mpsc::Receiver<Envelope>,
    mut handler_rx: watch::Receiver<Option<Arc<dyn RecvHandler>>>,
    concurrency: usize,
) {
    let gate = Arc::new(Semaphore::new(concurrency));
    while let Some(env) = rx.recv().await {
        // Park until a handler is installed; registration happens during
        // context construction, before peers start writing in earnest.
        let handler = match handler_rx.wait_for(|h| h.is_some()).await {
            Ok(slot) => slot.clone().expect("handler present after wait_for"),
            Err(_) => return,
        };

        let permit = match Arc::clone(&gate).acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };
        tokio::spawn(async move {
            if let Err(e) = handler.on_message(env.src, rank, env.bytes).await {
                fatal("shuffle delivery", &e);
            }
            // A dropped ack receiver just means the sender gave up waiting;
            // the message itself was handled.
            let _ = env.ack.send(());
            drop(permit);
        });
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.world_size
    }

    async fn send_one_way(&self, dst: Rank, bytes: Bytes) -> Result<()> {
        let inbox = self
            .inboxes
            .get(dst as usize)
            .ok_or(ShuffleError::UnknownPeer {
                rank: dst,
                world_size: self.world_size,
            })?;
        let (ack_tx, ack_rx) = oneshot::channel();
        inbox
            .send(Envelope {
                src: self.rank,
                bytes,
                ack: ack_tx,
            })
            .await
            .map_err(|_| ShuffleError::transport(format!("rank {dst} inbox closed")))?;

        match tokio::time::timeout(self.send_timeout, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ShuffleError::transport(format!(
                "rank {dst} dropped delivery ack"
            ))),
            Err(_) => Err(ShuffleError::SendTimeout {
                dst,
                after_ms: self.send_timeout.as_millis() as u64,
            }),
        }
    }

    fn register_receiver(&self, handler: Arc<dyn RecvHandler>) {
        let _ = self.handler.send(Some(handler));
    }

    async fn barrier(&self) -> Result<()> {
        self.barrier.wait().await;
        Ok(())
    }

    fn limits(&self) -> TransportLimits {
        TransportLimits {
            max_post: None,
            recv_concurrency: self.recv_concurrency,
        }
    }

    async fn shutdown(&self) -> Result<()> {
        // Drop the handler so the dispatcher/transport reference cycle
        // breaks; in-flight messages keep their already-cloned handler.
        let _ = self.handler.send(None);
        Ok(())
    }
}
