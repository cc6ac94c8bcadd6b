use std::sync::Arc;

use particle_shuffle::{MemorySink, QuicTransport, Shuffle};

use super::helpers::{base_cfg, full_path, name_owned_by};

#[tokio::test]
async fn test_shuffle_over_quic_mesh() {
    let cfg = base_cfg();
    let transports = QuicTransport::local_mesh(2, &cfg).await.unwrap();

    let sinks: Vec<Arc<MemorySink>> = (0..2).map(|_| Arc::new(MemorySink::new())).collect();
    let shuffles: Vec<Arc<Shuffle>> = transports
        .iter()
        .zip(&sinks)
        .map(|(t, sink)| Arc::new(Shuffle::new(cfg.clone(), t.clone(), sink.clone()).unwrap()))
        .collect();

    let crossing = name_owned_by(1, 2, &cfg);
    shuffles[0]
        .write(&full_path(&crossing), b"over quic", 0)
        .await
        .unwrap();
    shuffles[0].epoch_end(0).await.unwrap();
    shuffles[1].epoch_end(0).await.unwrap();

    let got = sinks[1].deliveries();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].path, full_path(&crossing));
    assert_eq!(got[0].payload, b"over quic");

    for s in &shuffles {
        s.finalize().await.unwrap();
    }
}

#[tokio::test]
async fn test_quic_paranoid_barrier() {
    let cfg = particle_shuffle::ShuffleConfig {
        paranoid_barrier: true,
        ..base_cfg()
    };
    let transports = QuicTransport::local_mesh(3, &cfg).await.unwrap();

    let mut tasks = Vec::new();
    for t in &transports {
        let sink = Arc::new(MemorySink::new());
        let shuffle = Arc::new(Shuffle::new(cfg.clone(), t.clone(), sink).unwrap());
        tasks.push(tokio::spawn(async move {
            shuffle.epoch_end(0).await.unwrap();
        }));
    }
    tokio::time::timeout(std::time::Duration::from_secs(10), async {
        for t in tasks {
            t.await.unwrap();
        }
    })
    .await
    .expect("quic barrier stalled");
}
