//! Node topology for the three-hop dispatcher.
//!
//! Ranks are partitioned into nodes by the launcher (the membership
//! resolver is external; this crate is handed one node id per rank). Each
//! node spreads its inter-node traffic across its local ranks: the rank
//! carrying traffic toward remote node `j` is `local_ranks[j % n_local]`.
//! Representatives are a pure function of the partition, so they are stable
//! for the lifetime of the context and every rank agrees on them.

use crate::error::{Result, ShuffleError};
use crate::types::Rank;

#[derive(Debug)]
pub struct Nexus {
    my_rank: Rank,
    my_node: u32,
    /// Dense node index per rank.
    node_of: Vec<u32>,
    /// Ranks per node, ascending.
    members: Vec<Vec<Rank>>,
}

impl Nexus {
    /// Build from one node id per rank (indexed by rank). Ids need not be
    /// dense; they are compacted in order of first appearance.
    pub fn new(my_rank: Rank, node_ids: Vec<u32>) -> Result<Self> {
        if node_ids.is_empty() {
            return Err(ShuffleError::Config("empty node map".into()));
        }
        if my_rank as usize >= node_ids.len() {
            return Err(ShuffleError::UnknownPeer {
                rank: my_rank,
                world_size: node_ids.len() as u32,
            });
        }

        let mut dense: Vec<u32> = Vec::new();
        let mut node_of = Vec::with_capacity(node_ids.len());
        let mut members: Vec<Vec<Rank>> = Vec::new();
        for (rank, &id) in node_ids.iter().enumerate() {
            let node = match dense.iter().position(|&d| d == id) {
                Some(n) => n,
                None => {
                    dense.push(id);
                    members.push(Vec::new());
                    dense.len() - 1
                }
            };
            node_of.push(node as u32);
            members[node].push(rank as Rank);
        }

        let my_node = node_of[my_rank as usize];
        Ok(Self {
            my_rank,
            my_node,
            node_of,
            members,
        })
    }

    /// Every rank on one node: the degenerate single-node world.
    pub fn single_node(my_rank: Rank, world_size: u32) -> Self {
        Self::new(my_rank, vec![0; world_size as usize]).expect("non-empty single-node map")
    }

    /// Ranks packed into nodes of `ranks_per_node`, in rank order.
    pub fn grouped(my_rank: Rank, world_size: u32, ranks_per_node: u32) -> Result<Self> {
        if ranks_per_node == 0 {
            return Err(ShuffleError::Config("ranks per node must be >= 1".into()));
        }
        Self::new(
            my_rank,
            (0..world_size).map(|r| r / ranks_per_node).collect(),
        )
    }

    pub fn world_size(&self) -> u32 {
        self.node_of.len() as u32
    }

    pub fn num_nodes(&self) -> usize {
        self.members.len()
    }

    pub fn node_of(&self, rank: Rank) -> u32 {
        self.node_of[rank as usize]
    }

    pub fn same_node(&self, a: Rank, b: Rank) -> bool {
        self.node_of(a) == self.node_of(b)
    }

    /// The rank on `dst_node` that accepts traffic originating on
    /// `src_node`.
    pub fn remote_rep(&self, dst_node: u32, src_node: u32) -> Rank {
        let locals = &self.members[dst_node as usize];
        locals[src_node as usize % locals.len()]
    }

    /// The rank on this rank's node that carries traffic toward `dst_node`.
    pub fn local_rep(&self, dst_node: u32) -> Rank {
        let locals = &self.members[self.my_node as usize];
        locals[dst_node as usize % locals.len()]
    }

    /// Where this rank posts a frame whose final destination is `dst`.
    ///
    /// Same node: straight to `dst`. Otherwise through this node's
    /// representative for the destination node, unless this rank *is* that
    /// representative, in which case across to the destination node's
    /// representative. A representative applying the same rule to a frame
    /// it received walks the remaining hops, so no path exceeds three.
    pub fn next_hop(&self, dst: Rank) -> Rank {
        let dst_node = self.node_of(dst);
        if dst_node == self.my_node {
            return dst;
        }
        let lr = self.local_rep(dst_node);
        if lr != self.my_rank {
            lr
        } else {
            self.remote_rep(dst_node, self.my_node)
        }
    }
}
