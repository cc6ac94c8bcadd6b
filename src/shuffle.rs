//! The shuffle context: the owned object graph behind the preload shim.
//!
//! A [`Shuffle`] wires the injected pieces together — transport, placement,
//! delivery sink, and the dispatcher picked by the configured topology —
//! and exposes the four operations the simulation drives: `write`,
//! `epoch_start`, `epoch_end`, `finalize`.

use std::sync::Arc;

use crate::config::ShuffleConfig;
use crate::dispatch::{Delivery, Dispatcher, DirectDispatcher, Nexus, ThreeHopDispatcher};
use crate::error::{Result, ShuffleError};
use crate::placement::Placement;
use crate::sink::{DeliverySink, TraceLog};
use crate::stats::{ShuffleStats, StatsSnapshot};
use crate::transport::Transport;
use crate::types::{Epoch, Rank, Topology, MAX_NAME_LEN, MAX_PAYLOAD_LEN};

pub struct Shuffle {
    rank: Rank,
    world_size: u32,
    topology: Topology,
    plfsdir: String,
    paranoid_barrier: bool,
    dispatcher: Dispatcher,
    transport: Arc<dyn Transport>,
    stats: Arc<ShuffleStats>,
}

impl Shuffle {
    /// Build a context over an established transport. Under the three-hop
    /// topology every rank is treated as one node; use [`Shuffle::with_nexus`]
    /// when the launcher knows the real node partition.
    pub fn new(
        cfg: ShuffleConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<Self> {
        let nexus = Nexus::single_node(transport.local_rank(), transport.world_size());
        Self::with_nexus(cfg, transport, nexus, sink)
    }

    pub fn with_nexus(
        cfg: ShuffleConfig,
        transport: Arc<dyn Transport>,
        nexus: Nexus,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<Self> {
        cfg.validate()?;
        let rank = transport.local_rank();
        let world_size = transport.world_size();
        if nexus.world_size() != world_size {
            return Err(ShuffleError::Config(format!(
                "nexus covers {} ranks, transport world is {world_size}",
                nexus.world_size()
            )));
        }

        let plfsdir = cfg
            .plfsdir
            .to_str()
            .ok_or_else(|| ShuffleError::Config("plfsdir is not utf-8".into()))?
            .trim_end_matches('/')
            .to_string();
        if plfsdir.is_empty() {
            return Err(ShuffleError::Config("plfsdir is not set".into()));
        }

        let trace = match (&cfg.testin, &cfg.trace_log) {
            (true, Some(path)) => Some(Arc::new(TraceLog::open(path)?)),
            _ => None,
        };

        let placement = Arc::new(Placement::from_config(&cfg, world_size)?);
        let stats = Arc::new(ShuffleStats::new());
        let delivery = Arc::new(Delivery {
            plfsdir: plfsdir.clone(),
            sink,
            trace,
        });

        if rank == 0 {
            log_selection(&cfg, world_size);
        }

        let dispatcher = match cfg.topology {
            Topology::Direct => Dispatcher::Direct(DirectDispatcher::new(
                &cfg,
                Arc::clone(&transport),
                placement,
                delivery,
                Arc::clone(&stats),
            )),
            Topology::ThreeHop => Dispatcher::ThreeHop(ThreeHopDispatcher::new(
                &cfg,
                Arc::clone(&transport),
                Arc::new(nexus),
                placement,
                delivery,
                Arc::clone(&stats),
            )),
        };

        Ok(Self {
            rank,
            world_size,
            topology: cfg.topology,
            plfsdir,
            paranoid_barrier: cfg.paranoid_barrier,
            dispatcher,
            transport,
            stats,
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Ship one record. `path` is the full file path as the simulation
    /// wrote it; it must live under the configured plfsdir root.
    ///
    /// Blocks only on the outbox lock and on send back-pressure, never on
    /// network completion.
    pub async fn write(&self, path: &str, payload: &[u8], epoch: Epoch) -> Result<()> {
        let name = self.strip_root(path)?;
        if name.is_empty() {
            return Err(ShuffleError::EmptyName);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(ShuffleError::FrameTooLarge {
                field: "name",
                len: name.len(),
                limit: MAX_NAME_LEN,
            });
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ShuffleError::FrameTooLarge {
                field: "payload",
                len: payload.len(),
                limit: MAX_PAYLOAD_LEN,
            });
        }
        self.dispatcher.write(name, payload, epoch).await
    }

    pub async fn epoch_start(&self, epoch: Epoch) -> Result<()> {
        self.dispatcher.epoch_start(epoch).await
    }

    /// Drain the epoch: flush every outbox, await every pending send, and
    /// (in paranoid mode) rendezvous with the rest of the world. When this
    /// has returned on every rank, every record of epoch <= `epoch` sits in
    /// its destination sink.
    pub async fn epoch_end(&self, epoch: Epoch) -> Result<()> {
        self.dispatcher.epoch_end(epoch).await?;
        if self.paranoid_barrier {
            self.transport.barrier().await?;
        }
        Ok(())
    }

    /// Drain, report, and tear the context down. The only termination path.
    pub async fn finalize(&self) -> Result<()> {
        self.dispatcher.finalize().await?;
        let snap = self.stats.snapshot();
        if snap.nps != 0 {
            tracing::info!(
                rank = self.rank,
                nms = snap.nms,
                nmd = snap.nmd,
                nmr = snap.nmr,
                "[rpc] outgoing queue depth: {:.3} per post, fill min: {} max: {}",
                snap.mean_queue_depth(),
                snap.minqsz,
                snap.maxqsz,
            );
        }
        self.transport.shutdown().await
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn strip_root<'a>(&self, path: &'a str) -> Result<&'a str> {
        path.strip_prefix(self.plfsdir.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| {
                ShuffleError::Config(format!(
                    "path {path:?} is outside the plfsdir root {:?}",
                    self.plfsdir
                ))
            })
    }
}

fn log_selection(cfg: &ShuffleConfig, world_size: u32) {
    match cfg.topology {
        Topology::ThreeHop => {
            tracing::info!("using the scalable 3-hop shuffler");
        }
        Topology::Direct => {
            tracing::warn!(
                "using the default direct shuffler: code might not scale well\n\
                 >>> switch to the 3-hop shuffler for better scalability"
            );
        }
    }
    if cfg.bypass_placement {
        tracing::warn!("ch-placement bypassed");
    } else {
        tracing::info!(
            "ch-placement group size: {world_size} (vir-factor: {}, proto: {})",
            cfg.virtual_factor,
            cfg.placement_protocol
        );
    }
    if cfg.subnet == "127.0.0.1" {
        tracing::warn!("using subnet {}*", cfg.subnet);
    } else {
        tracing::info!("using subnet {}*", cfg.subnet);
    }
    if cfg.transport_proto.contains("tcp") {
        tracing::warn!("using {}", cfg.transport_proto);
    } else {
        tracing::info!("using {}", cfg.transport_proto);
    }
}
