use std::net::SocketAddrV4;

use crate::common::Id;

use super::Rpc;

/// Information and statistics about this peer.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    local_addr: SocketAddrV4,
    key_space_bits: u8,
    routing_tree_size: usize,
    buckets: usize,
    open_transactions: usize,
    stored_values: usize,
}

impl Info {
    /// This peer's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }
    /// Address the transport of this peer is reachable at.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }
    pub fn key_space_bits(&self) -> u8 {
        self.key_space_bits
    }
    /// Number of nodes in the routing tree, this peer included.
    pub fn routing_tree_size(&self) -> usize {
        self.routing_tree_size
    }
    pub fn buckets(&self) -> usize {
        self.buckets
    }
    /// Queries still waiting for a reply.
    pub fn open_transactions(&self) -> usize {
        self.open_transactions
    }
    pub fn stored_values(&self) -> usize {
        self.stored_values
    }
}

impl From<&Rpc> for Info {
    fn from(rpc: &Rpc) -> Self {
        Self {
            id: *rpc.id(),
            local_addr: rpc.local_addr(),
            key_space_bits: rpc.config().routing.key_space_bits,
            routing_tree_size: rpc.routing_tree().size(),
            buckets: rpc.routing_tree().buckets().len(),
            open_transactions: rpc.transactions().len(),
            stored_values: rpc.store().len(),
        }
    }
}
