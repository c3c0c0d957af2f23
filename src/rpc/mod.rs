//! Kademlia RPC: message dispatch, transactions and routing maintenance.

pub mod config;
mod info;
pub mod iterative_query;
pub mod simulated;
pub mod transactions;
pub mod transport;

use std::net::SocketAddrV4;
use std::time::Instant;

use bytes::Bytes;
use flume::Sender;
use tracing::{debug, error, trace, warn};

use crate::common::{
    DataStore, Id, MemoryStore, Message, MessageBody, MessageKind, Node, RoutingTree,
    ValueResponse,
};
use crate::{Error, Result};

pub use config::Config;
pub use info::Info;
pub use iterative_query::{IterativeQuery, LookupKind, LookupResult, LookupRpc};
pub use simulated::{SimulatedNetwork, SimulatedSocket};
pub use transactions::{QueryOutcome, Reply, Transaction, Transactions};
pub use transport::{Datagram, Transport, UdpTransport};

#[derive(Debug)]
/// The state of one peer: its routing tree, open transactions and stored
/// values, and the transport it talks through.
///
/// Not thread safe, owned by a single dispatch loop.
pub struct Rpc {
    transport: Box<dyn Transport>,
    routing_tree: RoutingTree,
    transactions: Transactions,
    store: Box<dyn DataStore>,

    config: Config,

    /// Last time stale buckets were refreshed.
    last_maintenance: Instant,
}

impl Rpc {
    pub fn new(config: Config, transport: Box<dyn Transport>) -> Result<Self> {
        let bits = config.routing.key_space_bits;

        let id = match config.id {
            Some(id) if !id.fits(bits) => return Err(Error::InvalidNodeId(id, bits)),
            Some(id) => id,
            None => Id::random_within(bits),
        };

        let local = Node::new(id, transport.local_addr());
        let routing_tree = RoutingTree::new(local, config.routing)?;

        debug!(?id, address = ?transport.local_addr(), "Started a new peer");

        Ok(Rpc {
            transport,
            routing_tree,
            transactions: Transactions::new(),
            store: Box::new(MemoryStore::default()),
            config,
            last_maintenance: Instant::now(),
        })
    }

    // === Options ===

    pub fn with_store(mut self, store: Box<dyn DataStore>) -> Self {
        self.store = store;
        self
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        self.routing_tree.id()
    }

    /// Returns the address the transport is reachable at.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.transport.local_addr()
    }

    pub fn local_node(&self) -> &Node {
        self.routing_tree.local()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn routing_tree(&self) -> &RoutingTree {
        &self.routing_tree
    }

    pub fn transactions(&self) -> &Transactions {
        &self.transactions
    }

    pub fn store(&self) -> &dyn DataStore {
        self.store.as_ref()
    }

    pub fn info(&self) -> Info {
        Info::from(self)
    }

    // === Public Methods ===

    /// Decode and handle one inbound datagram.
    ///
    /// Malformed datagrams are logged and dropped.
    pub fn handle_datagram(&mut self, datagram: Datagram) {
        match Message::from_bytes(&datagram.bytes) {
            Ok(mut message) => {
                // The address a datagram arrived from wins over the declared one.
                message.source.address = datagram.from;
                self.handle_message(message);
            }
            Err(error) => {
                trace!(
                    context = "socket_error",
                    ?error,
                    from = ?datagram.from,
                    message = ?String::from_utf8_lossy(&datagram.bytes),
                    "Received invalid Bencode message."
                );
            }
        }
    }

    /// Handle a decoded message: learn about its sender, then answer the
    /// query or resolve the transaction it replies to.
    pub fn handle_message(&mut self, message: Message) {
        let bits = self.config.routing.key_space_bits;

        if !message.source.id.fits(bits) {
            warn!(
                source = ?message.source,
                error = %Error::InvalidNodeId(message.source.id, bits),
                "Dropped message"
            );
            return;
        }

        if &message.source.id == self.id() {
            trace!(source = ?message.source, "Dropped message claiming our own Id");
            return;
        }

        trace!(context = "rpc_message_receiving", kind = %message.kind(), from = ?message.source);

        self.observe(message.source.clone());

        if message.kind().is_query() {
            self.handle_query(message);
        } else {
            self.handle_reply(message);
        }
    }

    /// Send a query to a node.
    ///
    /// PING, FIND_NODE and FIND_VALUE open a transaction whose outcome is
    /// delivered to `response`. STORE expects no reply. Returns the
    /// transaction Id, or None if `body` is not a query.
    pub fn query(
        &mut self,
        to: Node,
        body: MessageBody,
        response: Option<Sender<QueryOutcome>>,
    ) -> Option<Id> {
        let kind = body.kind();

        if !kind.is_query() {
            error!(%kind, "Tried to send a reply as a query");
            return None;
        }

        let address = to.address;

        let xid = if kind.expects_reply() {
            self.transactions
                .create(kind, to, self.config.request_timeout, response)
        } else {
            Id::random()
        };

        self.send(address, xid, body);

        Some(xid)
    }

    /// Insert nodes into the routing tree, probing replace candidates.
    pub fn add_nodes(&mut self, nodes: Vec<Node>) {
        for node in nodes {
            if &node.id != self.id() {
                self.observe(node);
            }
        }
    }

    pub fn closest_nodes(&self, target: &Id) -> Vec<Node> {
        self.routing_tree.find_closest_nodes(target)
    }

    pub fn performed_lookup(&mut self, target: &Id) {
        self.routing_tree.performed_lookup(target);
    }

    pub fn local_value(&mut self, key_hash: &Id) -> Option<Bytes> {
        self.store.retrieve(key_hash)
    }

    /// Send a FIND_NODE to one random member of every stale bucket (every
    /// bucket if `force`), looking up that member's own Id.
    ///
    /// Returns the number of queries sent.
    pub fn refresh_nodes(&mut self, force: bool, response: Option<Sender<QueryOutcome>>) -> usize {
        let nodes = self.routing_tree.fetch_refresh_nodes(force);
        let count = nodes.len();

        for node in nodes {
            let target = node.id;

            self.routing_tree.performed_lookup(&target);
            self.query(node, MessageBody::FindNode { target }, response.clone());
        }

        if count > 0 {
            debug!(count, force, "Refreshing buckets");
        }

        count
    }

    /// Periodic housekeeping: expire transactions on every call, and
    /// refresh stale buckets at most once per maintenance interval.
    pub fn maintain(&mut self, now: Instant) {
        self.sweep_expired(now);

        if now.saturating_duration_since(self.last_maintenance) >= self.config.maintenance_interval {
            self.last_maintenance = now;
            self.refresh_nodes(false, None);
        }
    }

    /// Expire transactions, charging an error to every node that didn't
    /// answer, or replacing it if it was a stale candidate being probed.
    pub fn sweep_expired(&mut self, now: Instant) {
        for transaction in self.transactions.sweep_expired(now) {
            let id = transaction.destination.id;

            match transaction.replacement {
                Some(replacement) => {
                    debug!(stale = ?id, replacement = ?replacement.id, "Replacing unresponsive node");

                    if let Err(error) = self.routing_tree.replace_stale_node(&id, replacement) {
                        error!(?error, "Failed to replace a stale node");
                    }
                }
                None => {
                    trace!(?id, kind = %transaction.kind, "Query timed out");
                    self.routing_tree.error_node(&id);
                }
            }
        }
    }

    // === Private Methods ===

    /// Passive discovery: add a node we heard from, and probe the least
    /// recently seen node of its bucket if the bucket is full.
    fn observe(&mut self, node: Node) {
        match self.routing_tree.add_node(node.clone()) {
            Ok(None) => {}
            Ok(Some(candidate)) => self.probe(candidate, node),
            Err(error) => warn!(?error, ?node, "Failed to add node"),
        }
    }

    fn probe(&mut self, candidate: Node, replacement: Node) {
        if self.transactions.is_probing(&candidate.id) {
            return;
        }

        trace!(candidate = ?candidate.id, replacement = ?replacement.id, "Probing stale candidate");

        let address = candidate.address;
        let xid = self.transactions.create(
            MessageKind::Ping,
            candidate,
            self.config.request_timeout,
            None,
        );
        self.transactions.set_replacement(&xid, replacement);

        self.send(address, xid, MessageBody::Ping);
    }

    fn handle_query(&mut self, message: Message) {
        let Message { xid, source, body } = message;

        match body {
            MessageBody::Ping => {
                self.send(source.address, xid, MessageBody::Pong);
            }
            MessageBody::FindNode { target } => {
                let nodes = self.routing_tree.find_closest_nodes(&target);
                self.send(source.address, xid, MessageBody::ReturnNode { nodes });
            }
            MessageBody::FindValue { key_hash, .. } => {
                let response = match self.store.retrieve(&key_hash) {
                    Some(value) => ValueResponse::Found(value),
                    None => ValueResponse::NotFound(self.routing_tree.find_closest_nodes(&key_hash)),
                };

                self.send(source.address, xid, MessageBody::ReturnValue(response));
            }
            MessageBody::Store {
                key,
                key_hash,
                value,
            } => {
                let bits = self.config.routing.key_space_bits;

                if !key_hash.fits(bits) {
                    warn!(?key_hash, from = ?source, "Dropped store outside the key space");
                    return;
                }

                trace!(?key_hash, from = ?source, "Storing value");
                self.store.store(key, key_hash, value);
            }
            MessageBody::Pong | MessageBody::ReturnNode { .. } | MessageBody::ReturnValue(_) => {
                error!("handle_query called with a reply");
            }
        }
    }

    fn handle_reply(&mut self, message: Message) {
        let Some(transaction) = self.transactions.get(&message.xid) else {
            trace!(
                context = "socket_validation",
                xid = ?message.xid,
                from = ?message.source,
                "Unexpected response id"
            );
            return;
        };

        if transaction.kind.reply_kind() != Some(message.kind())
            || transaction.destination.id != message.source.id
        {
            trace!(
                context = "socket_validation",
                expected = %transaction.kind,
                kind = %message.kind(),
                from = ?message.source,
                "Response doesn't match its transaction"
            );
            return;
        }

        let Message { xid, body, .. } = message;

        let reply = match body {
            MessageBody::Pong => Reply::Pong,
            MessageBody::ReturnNode { nodes } => {
                let bits = self.config.routing.key_space_bits;
                let local = *self.id();

                let nodes: Vec<Node> = nodes
                    .into_iter()
                    .filter(|node| node.id.fits(bits) && node.id != local)
                    .collect();

                for node in &nodes {
                    // Hearsay never triggers a probe, nor updates a known contact.
                    if let Err(error) = self.routing_tree.add_heard_node(node.clone()) {
                        warn!(?error, ?node, "Failed to add node");
                    }
                }

                Reply::Nodes(nodes)
            }
            MessageBody::ReturnValue(ValueResponse::Found(value)) => Reply::Found(value),
            MessageBody::ReturnValue(ValueResponse::NotFound(nodes)) => {
                let bits = self.config.routing.key_space_bits;
                let local = *self.id();

                Reply::Nodes(
                    nodes
                        .into_iter()
                        .filter(|node| node.id.fits(bits) && node.id != local)
                        .collect(),
                )
            }
            MessageBody::Ping
            | MessageBody::FindNode { .. }
            | MessageBody::FindValue { .. }
            | MessageBody::Store { .. } => {
                error!("handle_reply called with a query");
                return;
            }
        };

        if let Some(transaction) = self.transactions.resolve(&xid, reply) {
            if transaction.replacement.is_some() {
                trace!(candidate = ?transaction.destination.id, "Stale candidate is alive");
            }
        }
    }

    fn send(&mut self, to: SocketAddrV4, xid: Id, body: MessageBody) {
        let message = Message::new(xid, self.routing_tree.local().clone(), body);
        trace!(context = "rpc_message_sending", kind = %message.kind(), ?to);

        let result = message
            .to_bytes()
            .and_then(|bytes| self.transport.send(to, &bytes));

        if let Err(error) = result {
            debug!(?error, ?to, "Error sending message");
        }
    }
}
