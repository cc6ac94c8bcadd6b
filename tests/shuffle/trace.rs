use std::sync::Arc;

use particle_shuffle::{LocalTransport, MemorySink, Shuffle, ShuffleConfig};

use super::helpers::{base_cfg, full_path, name_owned_by};

fn traced_cfg(log: &std::path::Path) -> ShuffleConfig {
    ShuffleConfig {
        testin: true,
        trace_log: Some(log.to_path_buf()),
        ..base_cfg()
    }
}

#[tokio::test]
async fn test_trace_lines_for_local_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("rank0.trace");
    let cfg = traced_cfg(&log);

    let world = LocalTransport::world(1, &cfg);
    let sink = Arc::new(MemorySink::new());
    let shuffle = Shuffle::new(cfg, world[0].clone(), sink).unwrap();

    let payload = [0x42u8; 8];
    shuffle
        .write(&full_path("eon.42"), &payload, 0)
        .await
        .unwrap();
    shuffle.epoch_end(0).await.unwrap();

    let hash = format!("{:08x}", xxhash_rust::xxh32::xxh32(&payload, 0));
    let text = std::fs::read_to_string(&log).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(
        lines[0],
        format!(
            "[SEND] {} 8 bytes (e0) r0 >> r0 (hash={hash})",
            full_path("eon.42")
        )
    );
    assert_eq!(
        lines[1],
        format!(
            "[RECV] {} 8 bytes (e0) r0 << r0 (hash={hash})",
            full_path("eon.42")
        )
    );
}

#[tokio::test]
async fn test_trace_crossing_ranks() {
    let dir = tempfile::tempdir().unwrap();
    let base = base_cfg();
    let name = name_owned_by(1, 2, &base);

    let logs: Vec<_> = (0..2)
        .map(|r| dir.path().join(format!("rank{r}.trace")))
        .collect();
    // One transport world; each rank gets its own trace target.
    let transports = LocalTransport::world(2, &base);
    let mut shuffles = Vec::new();
    for (rank, t) in transports.into_iter().enumerate() {
        let cfg = traced_cfg(&logs[rank]);
        let sink = Arc::new(MemorySink::new());
        shuffles.push(Shuffle::new(cfg, t, sink).unwrap());
    }

    shuffles[0]
        .write(&full_path(&name), b"xyz", 2)
        .await
        .unwrap();
    shuffles[0].epoch_end(2).await.unwrap();

    let hash = format!("{:08x}", xxhash_rust::xxh32::xxh32(b"xyz", 0));
    let sent = std::fs::read_to_string(&logs[0]).unwrap();
    assert_eq!(
        sent.trim_end(),
        format!(
            "[SEND] {} 3 bytes (e2) r0 >> r1 (hash={hash})",
            full_path(&name)
        )
    );
    let recvd = std::fs::read_to_string(&logs[1]).unwrap();
    assert_eq!(
        recvd.trim_end(),
        format!(
            "[RECV] {} 3 bytes (e2) r1 << r0 (hash={hash})",
            full_path(&name)
        )
    );
}
