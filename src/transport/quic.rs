//! Networked transport over QUIC.
//!
//! One connection per rank pair, built as a full mesh at bootstrap: rank
//! `i` initiates to every rank above it and accepts from every rank below,
//! announcing itself on a one-shot hello stream. Each one-way RPC is a
//! bidirectional stream — kind byte, origin rank, length-prefixed batch out;
//! one status byte back once the receive handler has run. That status byte
//! is the delivery acknowledgement `send_one_way` resolves on.
//!
//! Stream layout:
//!
//! ```text
//! hello  (uni) : 0x01, u32 BE rank
//! data   (bi)  : 0x02, u32 BE src, u64 LE len, payload   -> u8 status
//! barrier(bi)  : 0x03                                    -> u8 status
//! ```
//!
//! The barrier is coordinated by rank 0: every other rank posts a barrier
//! stream and blocks on the status byte, which rank 0 writes only after all
//! ranks (itself included) have arrived.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{oneshot, watch, Mutex, Semaphore};

use crate::config::ShuffleConfig;
use crate::error::{fatal, Result, ShuffleError};
use crate::transport::tls::{generate_self_signed_cert, make_client_config, make_server_config};
use crate::transport::{RecvHandler, Transport, TransportLimits};
use crate::types::Rank;

const STREAM_KIND_HELLO: u8 = 0x01;
const STREAM_KIND_DATA: u8 = 0x02;
const STREAM_KIND_BARRIER: u8 = 0x03;

/// Largest batch accepted on a data stream. Batches are a few KiB; anything
/// near this is a corrupt length prefix.
const MAX_MESSAGE_SIZE: u64 = 1024 * 1024;

type HandlerSlot = watch::Sender<Option<Arc<dyn RecvHandler>>>;

/// A bound endpoint that has not joined the mesh yet. Exists so the caller
/// can learn the local port, publish it through the external membership
/// resolver, and only then connect everyone to everyone.
pub struct BoundQuic {
    rank: Rank,
    world_size: u32,
    endpoint: quinn::Endpoint,
    local_addr: SocketAddr,
    cfg: ShuffleConfig,
}

impl BoundQuic {
    /// Bind a QUIC endpoint for `rank` of `world_size` on `addr`.
    pub fn bind(rank: Rank, world_size: u32, addr: SocketAddr, cfg: &ShuffleConfig) -> Result<Self> {
        if rank >= world_size {
            return Err(ShuffleError::UnknownPeer { rank, world_size });
        }
        let (cert, key) = generate_self_signed_cert()?;
        let server_config = make_server_config(cert, key)?;
        let mut endpoint = quinn::Endpoint::server(server_config, addr).map_err(|e| {
            ShuffleError::TransportInit {
                message: format!("bind {addr}"),
                source: Some(Box::new(e)),
            }
        })?;
        endpoint.set_default_client_config(make_client_config()?);
        let local_addr = endpoint
            .local_addr()
            .map_err(|e| ShuffleError::transport_with_source("local_addr", e))?;
        Ok(Self {
            rank,
            world_size,
            endpoint,
            local_addr,
            cfg: cfg.clone(),
        })
    }

    /// The address peers should dial, to be published via the resolver.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Join the mesh. `addrs` is the resolver's address book, indexed by
    /// rank; entry `rank` is ignored. All ranks must call this together.
    pub async fn into_mesh(self, addrs: &[SocketAddr]) -> Result<Arc<QuicTransport>> {
        if addrs.len() != self.world_size as usize {
            return Err(ShuffleError::transport_init(format!(
                "address book has {} entries for a world of {}",
                addrs.len(),
                self.world_size
            )));
        }

        let mut conns: Vec<Option<quinn::Connection>> = vec![None; self.world_size as usize];

        // Dial every rank above ours, announcing our rank on a hello stream.
        for peer in (self.rank + 1)..self.world_size {
            let conn = self
                .endpoint
                .connect(addrs[peer as usize], "localhost")
                .map_err(|e| ShuffleError::transport_with_source("mesh connect", e))?
                .await
                .map_err(|e| ShuffleError::transport_with_source("mesh handshake", e))?;
            let mut hello = conn
                .open_uni()
                .await
                .map_err(|e| ShuffleError::transport_with_source("hello stream", e))?;
            let mut buf = [0u8; 5];
            buf[0] = STREAM_KIND_HELLO;
            buf[1..].copy_from_slice(&self.rank.to_be_bytes());
            hello
                .write_all(&buf)
                .await
                .map_err(|e| ShuffleError::transport_with_source("hello write", e))?;
            hello
                .finish()
                .map_err(|e| ShuffleError::transport_with_source("hello finish", e))?;
            conns[peer as usize] = Some(conn);
        }

        // Accept one connection from every rank below ours.
        for _ in 0..self.rank {
            let incoming = self
                .endpoint
                .accept()
                .await
                .ok_or_else(|| ShuffleError::transport_init("endpoint closed during mesh"))?;
            let conn = incoming
                .await
                .map_err(|e| ShuffleError::transport_with_source("mesh accept", e))?;
            let mut hello = conn
                .accept_uni()
                .await
                .map_err(|e| ShuffleError::transport_with_source("hello accept", e))?;
            let mut buf = [0u8; 5];
            hello
                .read_exact(&mut buf)
                .await
                .map_err(|e| ShuffleError::transport_with_source("hello read", e))?;
            if buf[0] != STREAM_KIND_HELLO {
                return Err(ShuffleError::transport_init("peer spoke before hello"));
            }
            let peer = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
            if peer >= self.rank {
                return Err(ShuffleError::transport_init(format!(
                    "unexpected hello from rank {peer}"
                )));
            }
            conns[peer as usize] = Some(conn);
        }

        let (handler_tx, handler_rx) = watch::channel(None);
        let transport = Arc::new(QuicTransport {
            rank: self.rank,
            world_size: self.world_size,
            endpoint: self.endpoint,
            conns,
            handler: handler_tx,
            barrier: Mutex::new(BarrierRound::default()),
            send_timeout: self.cfg.send_timeout,
            max_outstanding: self.cfg.max_outstanding_rpcs,
        });

        for conn in transport.conns.iter().flatten() {
            tokio::spawn(accept_loop(
                Arc::clone(&transport),
                conn.clone(),
                handler_rx.clone(),
            ));
        }

        Ok(transport)
    }
}

/// Established mesh endpoint for one rank.
pub struct QuicTransport {
    rank: Rank,
    world_size: u32,
    endpoint: quinn::Endpoint,
    conns: Vec<Option<quinn::Connection>>,
    handler: HandlerSlot,
    /// Barrier round state; only consulted on rank 0.
    barrier: Mutex<BarrierRound>,
    send_timeout: std::time::Duration,
    max_outstanding: usize,
}

#[derive(Default)]
struct BarrierRound {
    arrived: u32,
    self_waiter: Option<oneshot::Sender<()>>,
    remote_waiters: Vec<quinn::SendStream>,
}

impl QuicTransport {
    /// Bind and mesh a whole world on loopback, one endpoint per rank.
    /// The networked analog of [`super::LocalTransport::world`], for tests
    /// and single-host runs.
    pub async fn local_mesh(world_size: u32, cfg: &ShuffleConfig) -> Result<Vec<Arc<QuicTransport>>> {
        let mut bound = Vec::with_capacity(world_size as usize);
        for rank in 0..world_size {
            bound.push(BoundQuic::bind(
                rank,
                world_size,
                "127.0.0.1:0".parse().expect("loopback addr"),
                cfg,
            )?);
        }
        let addrs: Vec<SocketAddr> = bound.iter().map(|b| b.local_addr()).collect();

        let mut joins = Vec::with_capacity(world_size as usize);
        for b in bound {
            let addrs = addrs.clone();
            joins.push(tokio::spawn(async move { b.into_mesh(&addrs).await }));
        }
        let mut world = Vec::with_capacity(world_size as usize);
        for j in joins {
            world.push(
                j.await
                    .map_err(|e| ShuffleError::transport_with_source("mesh task", e))??,
            );
        }
        world.sort_by_key(|t| t.rank);
        Ok(world)
    }

    /// Count one barrier arrival on rank 0; release everyone when the world
    /// is in.
    async fn barrier_arrive(
        &self,
        remote: Option<quinn::SendStream>,
        local: Option<oneshot::Sender<()>>,
    ) {
        let mut round = self.barrier.lock().await;
        round.arrived += 1;
        if let Some(stream) = remote {
            round.remote_waiters.push(stream);
        }
        if let Some(tx) = local {
            round.self_waiter = Some(tx);
        }
        if round.arrived == self.world_size {
            for mut stream in round.remote_waiters.drain(..) {
                if stream.write_all(&[0u8]).await.is_ok() {
                    let _ = stream.finish();
                }
            }
            if let Some(tx) = round.self_waiter.take() {
                let _ = tx.send(());
            }
            round.arrived = 0;
        }
    }
}

#[async_trait]
impl Transport for QuicTransport {
    fn local_rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.world_size
    }

    async fn send_one_way(&self, dst: Rank, bytes: Bytes) -> Result<()> {
        let conn = self
            .conns
            .get(dst as usize)
            .and_then(|c| c.as_ref())
            .ok_or(ShuffleError::UnknownPeer {
                rank: dst,
                world_size: self.world_size,
            })?;

        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| ShuffleError::transport_with_source("open data stream", e))?;

        let mut header = [0u8; 13];
        header[0] = STREAM_KIND_DATA;
        header[1..5].copy_from_slice(&self.rank.to_be_bytes());
        header[5..].copy_from_slice(&(bytes.len() as u64).to_le_bytes());
        send.write_all(&header)
            .await
            .map_err(|e| ShuffleError::transport_with_source("data header write", e))?;
        send.write_all(&bytes)
            .await
            .map_err(|e| ShuffleError::transport_with_source("data payload write", e))?;
        send.finish()
            .map_err(|e| ShuffleError::transport_with_source("data finish", e))?;

        let mut status = [0u8; 1];
        match tokio::time::timeout(self.send_timeout, recv.read_exact(&mut status)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ShuffleError::transport_with_source("delivery ack", e)),
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
        if self.world_size == 1 {
            return Ok(());
        }
        if self.rank == 0 {
            let (tx, rx) = oneshot::channel();
            self.barrier_arrive(None, Some(tx)).await;
            rx.await
                .map_err(|_| ShuffleError::transport("barrier round dropped"))?;
            return Ok(());
        }

        let conn = self.conns[0]
            .as_ref()
            .ok_or_else(|| ShuffleError::transport("no connection to rank 0"))?;
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| ShuffleError::transport_with_source("open barrier stream", e))?;
        send.write_all(&[STREAM_KIND_BARRIER])
            .await
            .map_err(|e| ShuffleError::transport_with_source("barrier write", e))?;
        send.finish()
            .map_err(|e| ShuffleError::transport_with_source("barrier finish", e))?;
        let mut status = [0u8; 1];
        recv.read_exact(&mut status)
            .await
            .map_err(|e| ShuffleError::transport_with_source("barrier ack", e))?;
        Ok(())
    }

    fn limits(&self) -> TransportLimits {
        TransportLimits {
            max_post: Some(self.max_outstanding),
            recv_concurrency: self.max_outstanding,
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let _ = self.handler.send(None);
        self.endpoint.close(0u32.into(), b"shuffle shutdown");
        Ok(())
    }
}

/// Accept loop for one peer connection: one task per incoming stream,
/// bounded by a semaphore so a slow sink backpressures the peer instead of
/// exhausting memory.
async fn accept_loop(
    transport: Arc<QuicTransport>,
    conn: quinn::Connection,
    handler_rx: watch::Receiver<Option<Arc<dyn RecvHandler>>>,
) {
    let gate = Arc::new(Semaphore::new(transport.max_outstanding));
    loop {
        let (send, recv) = match conn.accept_bi().await {
            Ok(s) => s,
            // Peer closed; normal at finalize.
            Err(_) => return,
        };
        let permit = match Arc::clone(&gate).acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };
        let transport = Arc::clone(&transport);
        let mut handler_rx = handler_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(&transport, send, recv, &mut handler_rx).await {
                fatal("shuffle rpc receive", &e);
            }
            drop(permit);
        });
    }
}

async fn handle_stream(
    transport: &QuicTransport,
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    handler_rx: &mut watch::Receiver<Option<Arc<dyn RecvHandler>>>,
) -> Result<()> {
    let mut kind = [0u8; 1];
    recv.read_exact(&mut kind)
        .await
        .map_err(|e| ShuffleError::transport_with_source("stream kind read", e))?;

    match kind[0] {
        STREAM_KIND_DATA => {
            let mut header = [0u8; 12];
            recv.read_exact(&mut header)
                .await
                .map_err(|e| ShuffleError::transport_with_source("data header read", e))?;
            let src = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
            let len = u64::from_le_bytes(header[4..].try_into().expect("8-byte slice"));
            if len > MAX_MESSAGE_SIZE {
                return Err(ShuffleError::corruption(format!(
                    "data stream claims {len} bytes"
                )));
            }
            let mut payload = vec![0u8; len as usize];
            recv.read_exact(&mut payload)
                .await
                .map_err(|e| ShuffleError::transport_with_source("data payload read", e))?;

            let handler = handler_rx
                .wait_for(|h| h.is_some())
                .await
                .map_err(|_| ShuffleError::transport("transport shut down mid-receive"))?
                .clone()
                .expect("handler present after wait_for");

            handler
                .on_message(src, transport.rank, Bytes::from(payload))
                .await?;

            send.write_all(&[0u8])
                .await
                .map_err(|e| ShuffleError::transport_with_source("ack write", e))?;
            let _ = send.finish();
            Ok(())
        }
        STREAM_KIND_BARRIER => {
            if transport.rank != 0 {
                return Err(ShuffleError::corruption(
                    "barrier stream at a non-coordinator rank",
                ));
            }
            transport.barrier_arrive(Some(send), None).await;
            Ok(())
        }
        other => Err(ShuffleError::corruption(format!(
            "unknown stream kind 0x{other:02x}"
        ))),
    }
}
