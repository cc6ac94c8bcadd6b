//! Blocking facade for the preload shim.
//!
//! The interposed write path of the simulation is plain C-style calls on
//! the simulation's own threads, so the async context is wrapped in a
//! runtime and every operation is a `block_on`. The process-global slot at
//! the bottom is the only global state in the crate; the shim installs one
//! context at bootstrap and drives it until finalize.

use std::future::Future;
use std::sync::OnceLock;

use crate::error::{Result, ShuffleError};
use crate::shuffle::Shuffle;
use crate::stats::StatsSnapshot;
use crate::types::{Epoch, Rank};

/// Blocking wrapper around [`Shuffle`]. Owns a tokio runtime and calls
/// `block_on()` for each operation.
pub struct SyncShuffle {
    inner: Shuffle,
    rt: tokio::runtime::Runtime,
}

impl SyncShuffle {
    /// Run `bootstrap` on a fresh runtime and wrap the context it builds.
    ///
    /// Transport and context construction both spawn background tasks, so
    /// the whole bootstrap has to happen inside the runtime this wrapper
    /// will keep driving.
    pub fn bootstrap<F, Fut>(bootstrap: F) -> Result<Self>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Shuffle>>,
    {
        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| ShuffleError::transport_with_source("tokio runtime", e))?;
        let inner = rt.block_on(bootstrap())?;
        Ok(Self { inner, rt })
    }

    pub fn rank(&self) -> Rank {
        self.inner.rank()
    }

    pub fn world_size(&self) -> u32 {
        self.inner.world_size()
    }

    pub fn write(&self, path: &str, payload: &[u8], epoch: Epoch) -> Result<()> {
        self.rt.block_on(self.inner.write(path, payload, epoch))
    }

    pub fn epoch_start(&self, epoch: Epoch) -> Result<()> {
        self.rt.block_on(self.inner.epoch_start(epoch))
    }

    pub fn epoch_end(&self, epoch: Epoch) -> Result<()> {
        self.rt.block_on(self.inner.epoch_end(epoch))
    }

    pub fn finalize(&self) -> Result<()> {
        self.rt.block_on(self.inner.finalize())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats()
    }
}

static GLOBAL: OnceLock<SyncShuffle> = OnceLock::new();

/// Install the process-wide context. Fails if one is already installed.
pub fn install(shuffle: SyncShuffle) -> Result<()> {
    GLOBAL
        .set(shuffle)
        .map_err(|_| ShuffleError::Config("shuffle context already installed".into()))
}

/// The installed context, if any.
pub fn global() -> Option<&'static SyncShuffle> {
    GLOBAL.get()
}
