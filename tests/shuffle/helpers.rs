use std::sync::Arc;

use particle_shuffle::{
    LocalTransport, MemorySink, Nexus, Shuffle, ShuffleConfig, StatsSnapshot, Topology,
};

pub const PLFSDIR: &str = "/plfs/particles";

pub fn base_cfg() -> ShuffleConfig {
    ShuffleConfig {
        plfsdir: PLFSDIR.into(),
        ..Default::default()
    }
}

/// An in-process world: one shuffle context and one recording sink per rank.
pub struct TestWorld {
    pub shuffles: Vec<Arc<Shuffle>>,
    pub sinks: Vec<Arc<MemorySink>>,
}

impl TestWorld {
    /// Spin a flat-topology world of `world_size` ranks.
    pub fn spin(world_size: u32, cfg: &ShuffleConfig) -> TestWorld {
        Self::build(world_size, cfg, |_| None)
    }

    /// Spin a three-hop world with `ranks_per_node` ranks packed per node.
    pub fn spin_three_hop(world_size: u32, ranks_per_node: u32, cfg: &ShuffleConfig) -> TestWorld {
        let cfg = ShuffleConfig {
            topology: Topology::ThreeHop,
            ..cfg.clone()
        };
        Self::build(world_size, &cfg, |rank| {
            Some(Nexus::grouped(rank, world_size, ranks_per_node).unwrap())
        })
    }

    fn build(
        world_size: u32,
        cfg: &ShuffleConfig,
        nexus_for: impl Fn(u32) -> Option<Nexus>,
    ) -> TestWorld {
        let transports = LocalTransport::world(world_size, cfg);
        let mut shuffles = Vec::with_capacity(world_size as usize);
        let mut sinks = Vec::with_capacity(world_size as usize);
        for (rank, transport) in transports.into_iter().enumerate() {
            let sink = Arc::new(MemorySink::new());
            let shuffle = match nexus_for(rank as u32) {
                Some(nexus) => {
                    Shuffle::with_nexus(cfg.clone(), transport, nexus, sink.clone()).unwrap()
                }
                None => Shuffle::new(cfg.clone(), transport, sink.clone()).unwrap(),
            };
            shuffles.push(Arc::new(shuffle));
            sinks.push(sink);
        }
        TestWorld { shuffles, sinks }
    }

    /// Run `f` on every rank concurrently and wait for all of them.
    pub async fn run_ranks<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<Shuffle>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let f = Arc::new(f);
        let mut tasks = Vec::new();
        for s in &self.shuffles {
            let s = Arc::clone(s);
            let f = Arc::clone(&f);
            tasks.push(tokio::spawn(async move { f(s).await }));
        }
        for t in tasks {
            t.await.unwrap();
        }
    }

    pub fn stats(&self) -> Vec<StatsSnapshot> {
        self.shuffles.iter().map(|s| s.stats()).collect()
    }

    /// Total records delivered across all sinks.
    pub fn total_delivered(&self) -> usize {
        self.sinks.iter().map(|s| s.len()).sum()
    }
}

pub fn full_path(name: &str) -> String {
    format!("{PLFSDIR}/{name}")
}

/// Destination oracle identical to the contexts': probe by writing nowhere.
/// Placement is deterministic, so a throwaway single-purpose instance gives
/// the same answer every context computes.
pub fn destination_of(name: &str, world_size: u32, cfg: &ShuffleConfig) -> u32 {
    use particle_shuffle::placement::Placement;
    Placement::from_config(cfg, world_size)
        .unwrap()
        .destination(name.as_bytes())
}

/// Find a name whose placement lands on `want`, for directed scenarios.
pub fn name_owned_by(want: u32, world_size: u32, cfg: &ShuffleConfig) -> String {
    use particle_shuffle::placement::Placement;
    let placement = Placement::from_config(cfg, world_size).unwrap();
    for i in 0..100_000 {
        let name = format!("probe.{i}");
        if placement.destination(name.as_bytes()) == want {
            return name;
        }
    }
    panic!("no name found with owner {want}");
}
