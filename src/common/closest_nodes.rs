use crate::common::{Id, Node};

/// Nodes sorted by ascending XOR distance to a target, deduplicated by [Id].
#[derive(Debug, Clone)]
pub struct ClosestNodes {
    target: Id,
    nodes: Vec<Node>,
}

impl ClosestNodes {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            nodes: Vec::with_capacity(200),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // === Public Methods ===

    /// Insert a node at its distance rank. Returns false if a node with the
    /// same id is already present.
    pub fn add(&mut self, node: Node) -> bool {
        let seek = node.distance(&self.target);

        // XOR with a fixed target is a bijection, so equal distances mean equal ids.
        match self
            .nodes
            .binary_search_by(|probe| probe.distance(&self.target).cmp(&seek))
        {
            Err(pos) => {
                self.nodes.insert(pos, node);
                true
            }
            Ok(_) => false,
        }
    }

    /// Remove a node by id.
    pub fn remove(&mut self, id: &Id) -> Option<Node> {
        let seek = id.xor(&self.target);

        match self
            .nodes
            .binary_search_by(|probe| probe.distance(&self.target).cmp(&seek))
        {
            Ok(pos) => Some(self.nodes.remove(pos)),
            Err(_) => None,
        }
    }

    /// The `count` closest nodes.
    pub fn take(&self, count: usize) -> &[Node] {
        &self.nodes[..count.min(self.nodes.len())]
    }

    pub fn into_vec(self) -> Vec<Node> {
        self.nodes
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddrV4;

    use super::*;

    fn node(id: u64) -> Node {
        Node::new(Id::from(id), SocketAddrV4::new(0.into(), 0))
    }

    #[test]
    fn keeps_nodes_sorted_and_unique() {
        let target = Id::from(100_u64);
        let mut closest = ClosestNodes::new(target);

        for id in [0, 255, 101, 96, 100, 101, 0] {
            closest.add(node(id));
        }

        let ids: Vec<Id> = closest.nodes().iter().map(|n| n.id).collect();
        assert_eq!(
            ids,
            [100, 101, 96, 0, 255]
                .iter()
                .map(|id| Id::from(*id as u64))
                .collect::<Vec<_>>()
        );

        for window in closest.nodes().windows(2) {
            assert!(window[0].distance(&target) < window[1].distance(&target));
        }
    }

    #[test]
    fn remove_and_take() {
        let mut closest = ClosestNodes::new(Id::MIN);

        for id in 1..10 {
            closest.add(node(id));
        }

        assert!(closest.remove(&Id::from(1_u64)).is_some());
        assert!(closest.remove(&Id::from(1_u64)).is_none());

        assert_eq!(closest.take(3).len(), 3);
        assert_eq!(closest.take(3)[0].id, Id::from(2_u64));
        assert_eq!(closest.take(100).len(), 8);
    }
}
