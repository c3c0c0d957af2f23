//! Iterative lookups: repeatedly query the closest known nodes to a target,
//! with at most `alpha` queries in flight, until the closest nodes are all
//! queried or a value is found.

use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use flume::{RecvTimeoutError, Sender};
use tracing::{debug, trace, warn};

use crate::common::{ClosestNodes, Id, MessageBody, Node};
use crate::errors::DhtWasShutdown;

use super::transactions::{QueryOutcome, Reply};

/// Extra patience on top of twice the request timeout, before a lookup
/// gives up on the dispatch loop reporting back.
const PATIENCE_MARGIN: Duration = Duration::from_millis(500);

/// What an [IterativeQuery] needs from the peer it runs for.
pub trait LookupRpc {
    fn local_id(&self) -> Id;

    /// Closest nodes to `target` in the local routing tree.
    fn closest_nodes(&self, target: &Id) -> Result<Vec<Node>, DhtWasShutdown>;

    /// Send a query, its outcome is delivered to `response`.
    fn query(
        &self,
        to: Node,
        body: MessageBody,
        response: Sender<QueryOutcome>,
    ) -> Result<(), DhtWasShutdown>;

    /// Record that a lookup was done for `target`.
    fn performed_lookup(&self, target: &Id) -> Result<(), DhtWasShutdown>;
}

#[derive(Debug, Clone)]
pub enum LookupKind {
    /// FIND_NODE lookup.
    Node,
    /// FIND_VALUE lookup for a key, the target being the key's hash.
    Value { key: Bytes },
}

#[derive(Debug, Clone)]
pub enum LookupResult {
    /// Up to `k` closest nodes to the target, sorted by distance.
    Nodes(Vec<Node>),
    /// A value lookup reached a node storing the value.
    Value(Bytes),
}

#[derive(Debug)]
pub struct IterativeQuery {
    target: Id,
    kind: LookupKind,
    candidates: ClosestNodes,
    queried: HashSet<Id>,
    /// Nodes with a query in flight.
    outstanding: HashSet<Id>,
    k: usize,
    alpha: usize,
    request_timeout: Duration,
}

impl IterativeQuery {
    pub fn new(target: Id, kind: LookupKind, k: usize, alpha: usize, request_timeout: Duration) -> Self {
        trace!(?target, ?kind, "New lookup");

        Self {
            target,
            kind,
            candidates: ClosestNodes::new(target),
            queried: HashSet::new(),
            outstanding: HashSet::new(),
            k,
            alpha: alpha.max(1),
            request_timeout,
        }
    }

    // === Public Methods ===

    /// Run the lookup to completion in the calling thread.
    pub fn run(mut self, rpc: &impl LookupRpc) -> Result<LookupResult, DhtWasShutdown> {
        let local = rpc.local_id();
        let (sender, receiver) = flume::unbounded::<QueryOutcome>();
        let patience = self.request_timeout * 2 + PATIENCE_MARGIN;

        for node in rpc.closest_nodes(&self.target)? {
            if node.id != local {
                self.candidates.add(node);
            }
        }

        loop {
            if self.is_done() {
                break;
            }

            while self.outstanding.len() < self.alpha {
                let Some(node) = self.next_candidate() else {
                    break;
                };

                self.queried.insert(node.id);
                self.outstanding.insert(node.id);

                rpc.query(node, self.message(), sender.clone())?;
            }

            if self.outstanding.is_empty() {
                trace!(target = ?self.target, "Lookup exhausted its candidates");
                break;
            }

            let outcome = match receiver.recv_timeout(patience) {
                Ok(outcome) => outcome,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    warn!(
                        target = ?self.target,
                        active = self.outstanding.len(),
                        "Abandoning unanswered queries"
                    );
                    self.outstanding.clear();
                    continue;
                }
            };

            // Late outcomes of abandoned queries don't free a slot.
            if !self.outstanding.remove(&outcome.from.id) {
                trace!(target = ?self.target, from = ?outcome.from.id, "Outcome of an abandoned query");
                continue;
            }

            match outcome.reply {
                Some(Reply::Found(value)) if matches!(self.kind, LookupKind::Value { .. }) => {
                    debug!(target = ?self.target, from = ?outcome.from.id, "Found value");
                    rpc.performed_lookup(&self.target)?;

                    return Ok(LookupResult::Value(value));
                }
                Some(Reply::Nodes(nodes)) => {
                    for node in nodes {
                        if node.id != local {
                            self.candidates.add(node);
                        }
                    }
                }
                // A timeout brings no new information, the node stays a
                // candidate and is never queried again.
                Some(_) | None => {}
            }
        }

        rpc.performed_lookup(&self.target)?;

        let closest = self.candidates.take(self.k).to_vec();

        debug!(
            target = ?self.target,
            queried = self.queried.len(),
            closest = closest.len(),
            "Done lookup"
        );

        Ok(LookupResult::Nodes(closest))
    }

    // === Private Methods ===

    /// More than `k` nodes were queried, including all of the `k` closest.
    fn is_done(&self) -> bool {
        self.queried.len() > self.k
            && self
                .candidates
                .take(self.k)
                .iter()
                .all(|node| self.queried.contains(&node.id))
    }

    fn next_candidate(&self) -> Option<Node> {
        self.candidates
            .nodes()
            .iter()
            .find(|node| !self.queried.contains(&node.id))
            .cloned()
    }

    fn message(&self) -> MessageBody {
        match &self.kind {
            LookupKind::Node => MessageBody::FindNode {
                target: self.target,
            },
            LookupKind::Value { key } => MessageBody::FindValue {
                key: key.clone(),
                key_hash: self.target,
            },
        }
    }
}
