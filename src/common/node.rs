//! Struct and implementation of the Node entry in the Kademlia routing tree
use std::cmp::Ordering;
use std::net::SocketAddrV4;
use std::time::Instant;

use crate::common::Id;

#[derive(Debug, Clone)]
/// Node entry in the Kademlia routing tree.
///
/// Nodes don't implement `PartialEq`, routing code compares them with
/// [Node::same_node], which only looks at the [Id].
pub struct Node {
    pub id: Id,
    pub address: SocketAddrV4,
    last_seen: Option<Instant>,
    errors: u32,
}

impl Node {
    /// Creates a new Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddrV4) -> Node {
        Node {
            id,
            address,
            last_seen: None,
            errors: 0,
        }
    }

    /// Create a node with a random Id for testing purposes.
    pub fn random() -> Node {
        Node::new(Id::random(), SocketAddrV4::new(0.into(), 0))
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    /// Last time we heard from this node directly, None if never.
    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    /// Consecutive failed contacts since the node was last seen.
    pub fn errors(&self) -> u32 {
        self.errors
    }

    // === Public Methods ===

    /// Routing identity: two nodes are the same if they share an [Id],
    /// regardless of their address.
    pub fn same_node(&self, other: &Node) -> bool {
        self.id == other.id
    }

    /// XOR distance between this node and a target.
    pub fn distance(&self, target: &Id) -> Id {
        self.id.xor(target)
    }

    /// Mark this node as alive.
    pub fn seen(&mut self) {
        self.last_seen = Some(Instant::now());
        self.errors = 0;
    }

    /// Count one failed contact and return the new total.
    pub fn error(&mut self) -> u32 {
        self.errors += 1;
        self.errors
    }
}

/// Comparator ordering nodes by ascending XOR distance to `target`.
pub fn by_distance(target: &Id) -> impl Fn(&Node, &Node) -> Ordering + '_ {
    move |a, b| a.distance(target).cmp(&b.distance(target))
}
