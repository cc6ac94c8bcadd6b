use super::helpers::{base_cfg, destination_of, full_path, name_owned_by, TestWorld};
use particle_shuffle::ShuffleConfig;

#[tokio::test]
async fn test_single_rank_no_network() {
    let world = TestWorld::spin(1, &base_cfg());
    let s = &world.shuffles[0];

    s.write(&full_path("eon.42"), &[0x42; 8], 0).await.unwrap();
    s.epoch_end(0).await.unwrap();

    let got = world.sinks[0].deliveries();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].path, full_path("eon.42"));
    assert_eq!(got[0].payload, vec![0x42; 8]);
    assert_eq!(got[0].epoch, 0);

    let snap = s.stats();
    assert_eq!(snap.nms, 0, "single-rank write must not touch the network");
    assert_eq!(snap.nmr, 0);
    s.finalize().await.unwrap();
}

#[tokio::test]
async fn test_all_to_all_names_converge() {
    // Four ranks each write the same 16 names once; every name must land on
    // its placement destination exactly four times, once per source.
    let cfg = base_cfg();
    let world = TestWorld::spin(4, &cfg);

    world
        .run_ranks(|s| async move {
            for i in 0..16 {
                s.write(&full_path(&format!("p{i}")), &[i as u8; 4], 0)
                    .await
                    .unwrap();
            }
            s.epoch_end(0).await.unwrap();
        })
        .await;

    let mut local_hits = 0u64;
    for i in 0..16 {
        let name = format!("p{i}");
        let owner = destination_of(&name, 4, &cfg) as usize;
        for (rank, sink) in world.sinks.iter().enumerate() {
            let copies = sink
                .deliveries()
                .iter()
                .filter(|d| d.path == full_path(&name))
                .count();
            if rank == owner {
                assert_eq!(copies, 4, "{name} should arrive 4x at rank {owner}");
            } else {
                assert_eq!(copies, 0, "{name} leaked to rank {rank}");
            }
        }
        // The owner wrote the name too; that copy stayed local.
        local_hits += 1;
    }
    assert_eq!(world.total_delivered(), 64);

    let stats = world.stats();
    let nms: u64 = stats.iter().map(|s| s.nms).sum();
    let nmr: u64 = stats.iter().map(|s| s.nmr).sum();
    let nmd: u64 = stats.iter().map(|s| s.nmd).sum();
    assert_eq!(nms, 64 - local_hits, "nms excludes self-delivered records");
    assert_eq!(nmr, nms);
    assert_eq!(nmd, nms);
}

#[tokio::test]
async fn test_bypass_placement_converges_on_mod_hash() {
    let cfg = ShuffleConfig {
        bypass_placement: true,
        ..base_cfg()
    };
    let world = TestWorld::spin(4, &cfg);

    world
        .run_ranks(|s| async move {
            s.write(&full_path("foo"), b"bar", 0).await.unwrap();
            s.epoch_end(0).await.unwrap();
        })
        .await;

    let owner = xxhash_rust::xxh32::xxh32(b"foo", 0) % 4;
    for (rank, sink) in world.sinks.iter().enumerate() {
        let expect = if rank as u32 == owner { 4 } else { 0 };
        assert_eq!(sink.len(), expect, "rank {rank}");
    }
    for d in world.sinks[owner as usize].deliveries() {
        assert_eq!(d.payload, b"bar");
    }
}

#[tokio::test]
async fn test_self_placed_name_skips_transport() {
    let cfg = base_cfg();
    let world = TestWorld::spin(4, &cfg);
    let mine = name_owned_by(2, 4, &cfg);

    let s = &world.shuffles[2];
    s.write(&full_path(&mine), b"local", 3).await.unwrap();
    s.epoch_end(3).await.unwrap();

    assert_eq!(world.sinks[2].len(), 1);
    let snap = s.stats();
    assert_eq!(snap.nms, 0);
    assert_eq!(snap.nps, 0);
}

#[tokio::test]
async fn test_force_sync_mode_delivers_identically() {
    let cfg = ShuffleConfig {
        force_sync: true,
        ..base_cfg()
    };
    let world = TestWorld::spin(3, &cfg);

    world
        .run_ranks(|s| async move {
            for i in 0..9 {
                s.write(&full_path(&format!("fs{i}")), &[7u8; 3], 0)
                    .await
                    .unwrap();
            }
            s.epoch_end(0).await.unwrap();
        })
        .await;

    assert_eq!(world.total_delivered(), 27);
    let stats = world.stats();
    let nms: u64 = stats.iter().map(|s| s.nms).sum();
    let nmd: u64 = stats.iter().map(|s| s.nmd).sum();
    assert_eq!(nms, nmd, "synchronous posts ack inline");
}

#[tokio::test]
async fn test_background_flusher_moves_idle_records() {
    // Short flush cadence: a staged record must reach its destination
    // without any epoch boundary.
    let cfg = ShuffleConfig {
        flush_period: std::time::Duration::from_millis(5),
        flush_idle_age: std::time::Duration::from_millis(5),
        ..base_cfg()
    };
    let world = TestWorld::spin(2, &cfg);
    let name = name_owned_by(1, 2, &cfg);

    world.shuffles[0]
        .write(&full_path(&name), b"idle", 0)
        .await
        .unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while world.sinks[1].is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("flusher never shipped the idle outbox");
}

#[tokio::test]
async fn test_large_record_stream_batches() {
    // Enough records to roll the 4 KiB batches over many times.
    let cfg = base_cfg();
    let world = TestWorld::spin(2, &cfg);
    let name = name_owned_by(1, 2, &cfg);

    let s = &world.shuffles[0];
    for i in 0..500u32 {
        s.write(&full_path(&name), &i.to_be_bytes(), 0)
            .await
            .unwrap();
    }
    s.epoch_end(0).await.unwrap();

    let got = world.sinks[1].deliveries();
    assert_eq!(got.len(), 500);
    // FIFO per (src, dst): payloads arrive in write order.
    for (i, d) in got.iter().enumerate() {
        assert_eq!(d.payload, (i as u32).to_be_bytes());
    }
    let snap = s.stats();
    assert_eq!(snap.nms, 500);
    assert!(snap.nps > 1, "500 records cannot fit one batch");
}
