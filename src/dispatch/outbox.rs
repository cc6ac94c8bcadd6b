//! Per-destination staging buffers.
//!
//! Frames bound for the same next hop coalesce in an outbox until the batch
//! cap fills, the epoch advances, or a flush point forces them out. A
//! buffer never mixes frames from two epochs.
//!
//! Batches leave through the `submit` callback, invoked while the table
//! lock is held: take-order per destination is decided here once, so two
//! flush paths racing on the same outbox cannot reorder its batches. The
//! callback must be cheap and non-blocking (the post office's enqueue is).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use crate::types::{Epoch, Rank};

/// A flushed batch, ready to hand to the transport.
#[derive(Debug)]
pub(crate) struct Batch {
    pub dst: Rank,
    pub bytes: Bytes,
    /// Frames inside `bytes`.
    pub frames: u64,
}

struct Outbox {
    buf: BytesMut,
    epoch: Option<Epoch>,
    frames: u64,
    last_append: Instant,
}

impl Outbox {
    fn new(cap: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(cap),
            epoch: None,
            frames: 0,
            last_append: Instant::now(),
        }
    }

    fn take(&mut self, dst: Rank) -> Batch {
        let batch = Batch {
            dst,
            bytes: self.buf.split().freeze(),
            frames: self.frames,
        };
        self.epoch = None;
        self.frames = 0;
        batch
    }
}

/// All outboxes of one dispatcher, created on first send to a peer.
pub(crate) struct OutboxTable {
    cap: usize,
    slots: Mutex<HashMap<Rank, Outbox>>,
}

impl OutboxTable {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Append one encoded frame for `dst`. If the outbox has to give up its
    /// current contents first (cap reached or epoch advanced), that batch
    /// is submitted before the frame lands — it holds older frames.
    pub fn stage(&self, dst: Rank, frame: &[u8], epoch: Epoch, submit: impl FnOnce(Batch)) {
        debug_assert!(frame.len() <= self.cap, "frame exceeds batch cap");
        let mut slots = self.slots.lock().expect("outbox lock");
        let outbox = slots.entry(dst).or_insert_with(|| Outbox::new(self.cap));

        let epoch_turn = outbox.epoch.is_some_and(|e| e != epoch);
        let full = outbox.buf.len() + frame.len() > self.cap;
        if !outbox.buf.is_empty() && (epoch_turn || full) {
            submit(outbox.take(dst));
        }

        outbox.buf.extend_from_slice(frame);
        outbox.epoch = Some(epoch);
        outbox.frames += 1;
        outbox.last_append = Instant::now();
    }

    /// Submit every non-empty outbox.
    pub fn flush_all(&self, mut submit: impl FnMut(Batch)) {
        let mut slots = self.slots.lock().expect("outbox lock");
        for (&dst, outbox) in slots.iter_mut() {
            if !outbox.buf.is_empty() {
                submit(outbox.take(dst));
            }
        }
    }

    /// Submit outboxes whose last append is older than `min_age`. The
    /// background flusher uses this to bound latency for low-rate peers.
    pub fn flush_idle(&self, min_age: Duration, mut submit: impl FnMut(Batch)) {
        let now = Instant::now();
        let mut slots = self.slots.lock().expect("outbox lock");
        for (&dst, outbox) in slots.iter_mut() {
            if !outbox.buf.is_empty() && now.duration_since(outbox.last_append) >= min_age {
                submit(outbox.take(dst));
            }
        }
    }
}
