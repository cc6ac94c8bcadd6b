/// Rank of a participant in the shuffle world (0-indexed).
pub type Rank = u32;

/// Simulation epoch. The producer advances epochs; all records of epoch `e`
/// are drained before epoch `e + 1` begins.
pub type Epoch = u16;

/// Which dispatch topology a shuffle context runs. Chosen at init,
/// immutable for the lifetime of the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    /// Flat neighbor-to-neighbor dispatch: every rank keeps one outbox per
    /// peer and posts batches directly to the final destination.
    Direct,
    /// Hierarchical dispatch: sender, local representative, remote
    /// representative, destination. At most three hops per record.
    ThreeHop,
}

impl Topology {
    pub const fn name(self) -> &'static str {
        match self {
            Topology::Direct => "direct",
            Topology::ThreeHop => "3hop",
        }
    }
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Hard ceiling on a single encoded frame. Frames are small by construction
/// (name and payload each fit a one-byte length); in practice a frame stays
/// under 200 bytes.
pub const MAX_FRAME_SIZE: usize = 512;

/// Longest name carried in a frame, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Longest record payload carried in a frame, in bytes.
pub const MAX_PAYLOAD_LEN: usize = 255;
