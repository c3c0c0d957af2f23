//! Table of outstanding queries awaiting a reply.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::Sender;

use crate::common::{Id, MessageKind, Node};

#[derive(Debug, Clone)]
/// Payload of a reply that resolved a transaction.
pub enum Reply {
    Pong,
    /// Nodes from a RETURN_NODE, or a RETURN_VALUE without the value.
    Nodes(Vec<Node>),
    Found(Bytes),
}

#[derive(Debug, Clone)]
/// Delivered to a transaction's response channel exactly once.
pub struct QueryOutcome {
    /// The node the query was sent to.
    pub from: Node,
    /// `None` if the query timed out.
    pub reply: Option<Reply>,
}

#[derive(Debug)]
pub struct Transaction {
    pub xid: Id,
    pub kind: MessageKind,
    pub destination: Node,
    pub sent_at: Instant,
    pub timeout: Duration,
    pub response: Option<Sender<QueryOutcome>>,
    /// Set on a liveness probe: the node waiting to take `destination`'s
    /// place if it doesn't answer.
    pub replacement: Option<Node>,
}

impl Transaction {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.sent_at + self.timeout < now
    }

    fn deliver(&self, reply: Option<Reply>) {
        if let Some(sender) = &self.response {
            // The receiver may already be gone, that is fine.
            let _ = sender.send(QueryOutcome {
                from: self.destination.clone(),
                reply,
            });
        }
    }
}

#[derive(Debug, Default)]
pub struct Transactions {
    open: HashMap<Id, Transaction>,
}

impl Transactions {
    pub fn new() -> Self {
        Self::default()
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    pub fn contains(&self, xid: &Id) -> bool {
        self.open.contains_key(xid)
    }

    pub fn get(&self, xid: &Id) -> Option<&Transaction> {
        self.open.get(xid)
    }

    /// Returns true if a liveness probe of `candidate` is already open.
    pub fn is_probing(&self, candidate: &Id) -> bool {
        self.open
            .values()
            .any(|t| t.replacement.is_some() && &t.destination.id == candidate)
    }

    // === Public Methods ===

    /// Open a transaction and return its fresh xid.
    pub fn create(
        &mut self,
        kind: MessageKind,
        destination: Node,
        timeout: Duration,
        response: Option<Sender<QueryOutcome>>,
    ) -> Id {
        let mut xid = Id::random();
        while self.open.contains_key(&xid) {
            xid = Id::random();
        }

        self.open.insert(
            xid,
            Transaction {
                xid,
                kind,
                destination,
                sent_at: Instant::now(),
                timeout,
                response,
                replacement: None,
            },
        );

        xid
    }

    pub fn set_replacement(&mut self, xid: &Id, replacement: Node) {
        if let Some(transaction) = self.open.get_mut(xid) {
            transaction.replacement = Some(replacement);
        }
    }

    /// Close a transaction, delivering the reply to its response channel.
    ///
    /// Unknown or already closed xids are ignored.
    pub fn resolve(&mut self, xid: &Id, reply: Reply) -> Option<Transaction> {
        let transaction = self.open.remove(xid)?;
        transaction.deliver(Some(reply));

        Some(transaction)
    }

    /// Close every transaction that expired before `now`, delivering a
    /// timeout to their response channels.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<Transaction> {
        let expired: Vec<Id> = self
            .open
            .values()
            .filter(|t| t.is_expired(now))
            .map(|t| t.xid)
            .collect();

        expired
            .iter()
            .filter_map(|xid| self.open.remove(xid))
            .inspect(|transaction| transaction.deliver(None))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn create_and_resolve() {
        let mut transactions = Transactions::new();
        let (tx, rx) = flume::unbounded();
        let node = Node::random();

        let xid = transactions.create(
            MessageKind::Ping,
            node.clone(),
            Duration::from_secs(2),
            Some(tx),
        );

        assert!(transactions.contains(&xid));
        assert_eq!(transactions.len(), 1);

        let resolved = transactions.resolve(&xid, Reply::Pong).unwrap();
        assert_eq!(resolved.kind, MessageKind::Ping);
        assert!(transactions.is_empty());

        let outcome = rx.try_recv().unwrap();
        assert!(outcome.from.same_node(&node));
        assert!(matches!(outcome.reply, Some(Reply::Pong)));

        // A second reply with the same xid is ignored.
        assert!(transactions.resolve(&xid, Reply::Pong).is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unique_xids() {
        let mut transactions = Transactions::new();

        for _ in 0..100 {
            transactions.create(
                MessageKind::FindNode,
                Node::random(),
                Duration::from_secs(2),
                None,
            );
        }

        assert_eq!(transactions.len(), 100);
    }

    #[test]
    fn sweep_expired() {
        let mut transactions = Transactions::new();
        let (tx, rx) = flume::unbounded();

        let short = transactions.create(
            MessageKind::FindNode,
            Node::random(),
            Duration::ZERO,
            Some(tx.clone()),
        );
        let long = transactions.create(
            MessageKind::FindNode,
            Node::random(),
            Duration::from_secs(60),
            Some(tx),
        );

        let expired = transactions.sweep_expired(Instant::now() + Duration::from_millis(1));

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].xid, short);
        assert!(transactions.contains(&long));

        let outcome = rx.try_recv().unwrap();
        assert!(outcome.reply.is_none());
        assert!(rx.try_recv().is_err());

        // A late reply to an expired transaction is ignored.
        assert!(transactions.resolve(&short, Reply::Pong).is_none());
    }

    #[test]
    fn dropped_receiver() {
        let mut transactions = Transactions::new();
        let (tx, rx) = flume::unbounded();
        drop(rx);

        let xid = transactions.create(
            MessageKind::Ping,
            Node::random(),
            Duration::from_secs(2),
            Some(tx),
        );

        assert!(transactions.resolve(&xid, Reply::Pong).is_some());
    }

    #[test]
    fn probing() {
        let mut transactions = Transactions::new();
        let candidate = Node::random();

        let xid = transactions.create(
            MessageKind::Ping,
            candidate.clone(),
            Duration::from_secs(2),
            None,
        );
        assert!(!transactions.is_probing(&candidate.id));

        transactions.set_replacement(&xid, Node::random());
        assert!(transactions.is_probing(&candidate.id));

        transactions.resolve(&xid, Reply::Pong);
        assert!(!transactions.is_probing(&candidate.id));
    }
}
