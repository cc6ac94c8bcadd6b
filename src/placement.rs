//! Placement oracle: maps a record name to the rank that owns it.
//!
//! Every producing rank runs the same pure function over the same inputs,
//! so all ranks converge on one owner per name. That determinism is the
//! only correctness requirement here; the token layout just has to spread
//! names evenly.

use xxhash_rust::xxh32::xxh32;
use xxhash_rust::xxh64::xxh64;

use crate::config::ShuffleConfig;
use crate::error::{Result, ShuffleError};
use crate::types::Rank;

/// Name-to-rank placement, shared read-only after init.
#[derive(Debug)]
pub enum Placement {
    /// `xxh32(name) % world_size`, no ring.
    Bypass { world_size: u32, seed: u32 },
    /// Consistent-hash ring with `world_size * virtual_factor` tokens.
    Ring(Ring),
}

impl Placement {
    /// Build the placement selected by `cfg` for a world of `world_size`.
    pub fn from_config(cfg: &ShuffleConfig, world_size: u32) -> Result<Self> {
        if world_size == 0 {
            return Err(ShuffleError::Config("world size must be >= 1".into()));
        }
        if cfg.bypass_placement {
            return Ok(Placement::Bypass {
                world_size,
                seed: 0,
            });
        }
        match cfg.placement_protocol.as_str() {
            "ring" => Ok(Placement::Ring(Ring::build(
                world_size,
                cfg.virtual_factor,
                0,
            ))),
            other => Err(ShuffleError::UnknownPlacementProtocol(other.into())),
        }
    }

    /// The rank that owns `name`. Always in `[0, world_size)`.
    pub fn destination(&self, name: &[u8]) -> Rank {
        match self {
            Placement::Bypass { world_size, seed } => xxh32(name, *seed) % world_size,
            Placement::Ring(ring) => ring.owner(xxh64(name, ring.seed)),
        }
    }

    pub fn world_size(&self) -> u32 {
        match self {
            Placement::Bypass { world_size, .. } => *world_size,
            Placement::Ring(ring) => ring.world_size,
        }
    }
}

/// A consistent-hash ring. Each rank contributes `virtual_factor` tokens;
/// a key belongs to the owner of the first token at or past its hash,
/// wrapping to the smallest token when none is.
#[derive(Debug)]
pub struct Ring {
    world_size: u32,
    seed: u64,
    /// Sorted by token hash; owner breaks the (never expected) tie.
    tokens: Vec<(u64, Rank)>,
}

impl Ring {
    fn build(world_size: u32, virtual_factor: u32, seed: u64) -> Self {
        let mut tokens = Vec::with_capacity(world_size as usize * virtual_factor as usize);
        let mut key = [0u8; 16];
        for rank in 0..world_size {
            key[..8].copy_from_slice(&(rank as u64).to_le_bytes());
            for v in 0..virtual_factor {
                key[8..].copy_from_slice(&(v as u64).to_le_bytes());
                tokens.push((xxh64(&key, seed), rank));
            }
        }
        tokens.sort_unstable();
        Ring {
            world_size,
            seed,
            tokens,
        }
    }

    fn owner(&self, hash: u64) -> Rank {
        let idx = self.tokens.partition_point(|&(t, _)| t < hash);
        let (_, rank) = if idx == self.tokens.len() {
            self.tokens[0]
        } else {
            self.tokens[idx]
        };
        rank
    }
}
