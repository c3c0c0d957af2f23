//! Dht node.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::{Receiver, RecvError, Sender};
use tracing::{debug, info};

use crate::common::{hash_key, DataStore, Id, MemoryStore, MessageBody, Node, RoutingTree};
use crate::errors::DhtWasShutdown;
use crate::rpc::{
    config::Config, Datagram, Info, IterativeQuery, LookupKind, LookupResult, LookupRpc,
    QueryOutcome, Rpc, SimulatedNetwork, Transport, UdpTransport,
};
use crate::Result;

#[derive(Debug, Clone)]
/// A handle to a Kademlia peer running in its own thread.
///
/// Clones share the same peer. The peer stops once every handle is dropped
/// or [Dht::shutdown] is called.
pub struct Dht {
    pub(crate) sender: Sender<ActorMessage>,
    local: Node,
    config: Config,
}

impl Dht {
    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    /// Create a new Dht node listening on UDP.
    pub fn new(config: Config) -> Result<Self> {
        let address = config
            .bind_address
            .unwrap_or(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

        let (transport, inbound) = UdpTransport::bind(address)?;

        Dht::with_transport(config, Box::new(transport), inbound)
    }

    /// Create a new Dht node on an arbitrary [Transport], receiving its
    /// inbound datagrams from `inbound`.
    pub fn with_transport(
        config: Config,
        transport: Box<dyn Transport>,
        inbound: Receiver<Datagram>,
    ) -> Result<Self> {
        Dht::with_store(config, transport, inbound, Box::new(MemoryStore::default()))
    }

    /// Like [Dht::with_transport], keeping values received with STORE in
    /// a custom [DataStore].
    pub fn with_store(
        config: Config,
        transport: Box<dyn Transport>,
        inbound: Receiver<Datagram>,
        store: Box<dyn DataStore>,
    ) -> Result<Self> {
        let rpc = Rpc::new(config.clone(), transport)?.with_store(store);
        let local = rpc.local_node().clone();

        let (sender, receiver) = flume::unbounded();

        thread::Builder::new()
            .name(format!("kadtrie-{}", local.address))
            .spawn(move || run(rpc, receiver, inbound))?;

        Ok(Dht {
            sender,
            local,
            config,
        })
    }

    // === Getters ===

    /// This node's [Id].
    pub fn id(&self) -> &Id {
        &self.local.id
    }

    /// Address this node is reachable at.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local.address
    }

    /// This node as it is seen by other nodes.
    pub fn local_node(&self) -> Node {
        self.local.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Information and statistics about this [Dht] node.
    pub fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.send(ActorMessage::Info(sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// A snapshot of this node's routing tree.
    pub fn routing_tree(&self) -> Result<RoutingTree, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<RoutingTree>(1);

        self.send(ActorMessage::RoutingTree(sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Stop the actor thread and wait until it is done.
    pub fn shutdown(&self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        if self.send(ActorMessage::Shutdown(sender)).is_ok() {
            let _ = receiver.recv();
        }
    }

    /// Join the network through some known nodes.
    ///
    /// Looks up this node's own [Id], then refreshes every bucket, and
    /// returns the closest nodes found.
    pub fn join(&self, seeds: &[Node]) -> Result<Vec<Node>, DhtWasShutdown> {
        self.send(ActorMessage::AddNodes(seeds.to_vec()))?;

        let closest = self.find_node(self.local.id)?;

        let (outcomes, outcomes_receiver) = flume::unbounded::<QueryOutcome>();
        let (count, count_receiver) = flume::bounded::<usize>(1);

        self.send(ActorMessage::RefreshNodes(outcomes, count))?;
        let count = count_receiver.recv().map_err(|_| DhtWasShutdown)?;

        let patience = self.config.request_timeout * 2;
        let deadline = Instant::now() + patience;

        for _ in 0..count {
            let remaining = deadline.saturating_duration_since(Instant::now());

            if outcomes_receiver.recv_timeout(remaining).is_err() {
                break;
            }
        }

        let size = self.info()?.routing_tree_size();
        if size <= 1 {
            info!(id = ?self.local.id, "Could not join the network");
        } else {
            debug!(id = ?self.local.id, size, "Joined the network");
        }

        Ok(closest)
    }

    /// Find the `k` closest nodes to a target.
    pub fn find_node(&self, target: Id) -> Result<Vec<Node>, DhtWasShutdown> {
        match self.lookup(target, LookupKind::Node)? {
            LookupResult::Nodes(nodes) => Ok(nodes),
            LookupResult::Value(_) => Ok(vec![]),
        }
    }

    /// Store a value on the `k` closest nodes to the hash of its key.
    ///
    /// Returns the nodes a STORE was sent to.
    pub fn store(&self, key: &[u8], value: &[u8]) -> Result<Vec<Node>, DhtWasShutdown> {
        let key_hash = hash_key(key, self.config.routing.key_space_bits);
        let key = Bytes::copy_from_slice(key);
        let value = Bytes::copy_from_slice(value);

        let nodes = self.find_node(key_hash)?;

        for node in &nodes {
            self.send(ActorMessage::Query(
                node.clone(),
                MessageBody::Store {
                    key: key.clone(),
                    key_hash,
                    value: value.clone(),
                },
                None,
            ))?;
        }

        debug!(?key_hash, nodes = nodes.len(), "Stored value");

        Ok(nodes)
    }

    /// Get a value by its key, from the local store or the network.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>, DhtWasShutdown> {
        let key_hash = hash_key(key, self.config.routing.key_space_bits);

        let (sender, receiver) = flume::bounded::<Option<Bytes>>(1);
        self.send(ActorMessage::LocalValue(key_hash, sender))?;

        if let Some(value) = receiver.recv().map_err(|_| DhtWasShutdown)? {
            return Ok(Some(value));
        }

        match self.lookup(
            key_hash,
            LookupKind::Value {
                key: Bytes::copy_from_slice(key),
            },
        )? {
            LookupResult::Value(value) => Ok(Some(value)),
            LookupResult::Nodes(_) => Ok(None),
        }
    }

    /// Ping a node, returns true if it replied in time.
    pub fn ping(&self, node: Node) -> Result<bool, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<QueryOutcome>(1);

        self.send(ActorMessage::Query(node, MessageBody::Ping, Some(sender)))?;

        let outcome = receiver.recv().map_err(|_| DhtWasShutdown)?;

        Ok(outcome.reply.is_some())
    }

    // === Private Methods ===

    fn lookup(&self, target: Id, kind: LookupKind) -> Result<LookupResult, DhtWasShutdown> {
        IterativeQuery::new(
            target,
            kind,
            self.config.routing.k,
            self.config.alpha,
            self.config.request_timeout,
        )
        .run(self)
    }

    fn send(&self, message: ActorMessage) -> Result<(), DhtWasShutdown> {
        self.sender.send(message).map_err(|_| DhtWasShutdown)
    }
}

impl LookupRpc for Dht {
    fn local_id(&self) -> Id {
        self.local.id
    }

    fn closest_nodes(&self, target: &Id) -> Result<Vec<Node>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<Node>>(1);

        self.send(ActorMessage::ClosestNodes(*target, sender))?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    fn query(
        &self,
        to: Node,
        body: MessageBody,
        response: Sender<QueryOutcome>,
    ) -> Result<(), DhtWasShutdown> {
        self.send(ActorMessage::Query(to, body, Some(response)))
    }

    fn performed_lookup(&self, target: &Id) -> Result<(), DhtWasShutdown> {
        self.send(ActorMessage::PerformedLookup(*target))
    }
}

#[derive(Debug, Default, Clone)]
/// Create a Dht node.
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Set bucket capacity and the number of closest nodes returned by lookups.
    pub fn k(mut self, k: usize) -> Self {
        self.0.routing.k = k;
        self
    }

    /// Set the number of concurrent queries per lookup.
    pub fn alpha(mut self, alpha: usize) -> Self {
        self.0.alpha = alpha;
        self
    }

    /// Set the number of errors after which a node is evicted.
    pub fn error_threshold(mut self, error_threshold: u32) -> Self {
        self.0.routing.error_threshold = error_threshold;
        self
    }

    /// Set the depth below which buckets split even if they don't contain this node.
    pub fn split_depth_limit(mut self, split_depth_limit: u8) -> Self {
        self.0.routing.split_depth_limit = split_depth_limit;
        self
    }

    /// Set the width of the key space in bits.
    pub fn key_space_bits(mut self, key_space_bits: u8) -> Self {
        self.0.routing.key_space_bits = key_space_bits;
        self
    }

    pub fn refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.0.routing.refresh_interval = refresh_interval;
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.0.request_timeout = request_timeout;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.0.poll_interval = poll_interval;
        self
    }

    pub fn maintenance_interval(mut self, maintenance_interval: Duration) -> Self {
        self.0.maintenance_interval = maintenance_interval;
        self
    }

    /// Set an explicit node Id.
    pub fn id(mut self, id: Id) -> Self {
        self.0.id = Some(id);
        self
    }

    /// Set the address to bind to.
    pub fn bind_address(mut self, address: SocketAddrV4) -> Self {
        self.0.bind_address = Some(address);
        self
    }

    pub fn config(&self) -> &Config {
        &self.0
    }

    /// Create a Dht node listening on UDP.
    pub fn build(self) -> Result<Dht> {
        Dht::new(self.0)
    }

    /// Create a Dht node connected to a [SimulatedNetwork], at the
    /// configured bind address if any.
    pub fn build_simulated(self, network: &SimulatedNetwork) -> Result<Dht> {
        let (socket, inbound) = network.connect(self.0.bind_address)?;

        Dht::with_transport(self.0, Box::new(socket), inbound)
    }
}

enum Event {
    Command(std::result::Result<ActorMessage, RecvError>),
    Datagram(std::result::Result<Datagram, RecvError>),
}

/// The dispatch loop: the only place the [Rpc] state is touched.
fn run(mut rpc: Rpc, receiver: Receiver<ActorMessage>, inbound: Receiver<Datagram>) {
    let poll_interval = rpc.config().poll_interval;
    let mut shutdown_ack = None;

    info!(id = ?rpc.id(), address = ?rpc.local_addr(), "Kademlia node listening");

    loop {
        let event = flume::Selector::new()
            .recv(&receiver, Event::Command)
            .recv(&inbound, Event::Datagram)
            .wait_timeout(poll_interval);

        match event {
            Ok(Event::Command(Ok(ActorMessage::Shutdown(sender)))) => {
                shutdown_ack = Some(sender);
                break;
            }
            Ok(Event::Command(Ok(message))) => handle_command(&mut rpc, message),
            Ok(Event::Command(Err(RecvError::Disconnected))) => {
                debug!("kadtrie::Dht's actor thread was shutdown after Drop.");
                break;
            }
            Ok(Event::Datagram(Ok(datagram))) => rpc.handle_datagram(datagram),
            Ok(Event::Datagram(Err(RecvError::Disconnected))) => {
                debug!("Transport closed, stopping the actor thread.");
                break;
            }
            Err(_) => {}
        }

        rpc.maintain(Instant::now());
    }

    // Drop the transport before acknowledging the shutdown.
    drop(rpc);

    if let Some(sender) = shutdown_ack {
        let _ = sender.send(());
    }
}

fn handle_command(rpc: &mut Rpc, message: ActorMessage) {
    match message {
        ActorMessage::Info(sender) => {
            let _ = sender.send(rpc.info());
        }
        ActorMessage::RoutingTree(sender) => {
            let _ = sender.send(rpc.routing_tree().clone());
        }
        ActorMessage::AddNodes(nodes) => rpc.add_nodes(nodes),
        ActorMessage::ClosestNodes(target, sender) => {
            let _ = sender.send(rpc.closest_nodes(&target));
        }
        ActorMessage::Query(to, body, response) => {
            if let (None, Some(response)) = (rpc.query(to.clone(), body, response.clone()), response) {
                let _ = response.send(QueryOutcome {
                    from: to,
                    reply: None,
                });
            }
        }
        ActorMessage::PerformedLookup(target) => rpc.performed_lookup(&target),
        ActorMessage::RefreshNodes(outcomes, count) => {
            let _ = count.send(rpc.refresh_nodes(true, Some(outcomes)));
        }
        ActorMessage::LocalValue(key_hash, sender) => {
            let _ = sender.send(rpc.local_value(&key_hash));
        }
        ActorMessage::Shutdown(_) => {}
    }
}

#[derive(Debug)]
pub(crate) enum ActorMessage {
    Shutdown(Sender<()>),
    Info(Sender<Info>),
    RoutingTree(Sender<RoutingTree>),
    AddNodes(Vec<Node>),
    ClosestNodes(Id, Sender<Vec<Node>>),
    Query(Node, MessageBody, Option<Sender<QueryOutcome>>),
    PerformedLookup(Id),
    RefreshNodes(Sender<QueryOutcome>, Sender<usize>),
    LocalValue(Id, Sender<Option<Bytes>>),
}

/// Create a testnet of Dht nodes on a [SimulatedNetwork].
#[derive(Debug)]
pub struct Testnet {
    pub network: SimulatedNetwork,
    pub bootstrap: Vec<Node>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    pub fn new(count: usize) -> Result<Testnet> {
        Testnet::with_builder(count, Dht::builder())
    }

    /// Create `count` nodes sharing the builder's settings (an explicit
    /// [Id] or bind address in it is ignored), each joining through the
    /// first one.
    pub fn with_builder(count: usize, builder: DhtBuilder) -> Result<Testnet> {
        let network = SimulatedNetwork::new();

        let mut config = builder.0;
        config.id = None;
        config.bind_address = None;

        let mut nodes: Vec<Dht> = vec![];
        let mut bootstrap = vec![];

        for i in 0..count {
            let node = DhtBuilder(config.clone()).build_simulated(&network)?;

            if i == 0 {
                bootstrap.push(node.local_node());
            } else {
                node.join(&bootstrap)?;
            }

            nodes.push(node)
        }

        Ok(Self {
            network,
            bootstrap,
            nodes,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fast() -> DhtBuilder {
        Dht::builder()
            .request_timeout(Duration::from_millis(200))
            .poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn shutdown() {
        let network = SimulatedNetwork::new();
        let dht = fast().build_simulated(&network).unwrap();

        let clone = dht.clone();
        let address = dht.local_addr();

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));

            clone.shutdown();
        })
        .join()
        .unwrap();

        assert!(!network.is_connected(&address));
        assert_eq!(dht.info().unwrap_err(), DhtWasShutdown);
        assert_eq!(dht.find_node(Id::random()).unwrap_err(), DhtWasShutdown);
    }

    #[test]
    fn drop_stops_the_actor() {
        let network = SimulatedNetwork::new();
        let dht = fast().build_simulated(&network).unwrap();

        drop(dht);

        let deadline = Instant::now() + Duration::from_secs(2);
        while !network.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        assert!(network.is_empty());
    }

    #[test]
    fn info() {
        let network = SimulatedNetwork::new();
        let dht = fast().id(Id::from(7_u64)).build_simulated(&network).unwrap();

        let info = dht.info().unwrap();

        assert_eq!(info.id(), &Id::from(7_u64));
        assert_eq!(info.local_addr(), dht.local_addr());
        assert_eq!(info.routing_tree_size(), 1);
        assert_eq!(info.key_space_bits(), 160);
    }

    #[test]
    fn ping() {
        let network = SimulatedNetwork::new();
        let a = fast().build_simulated(&network).unwrap();
        let b = fast().build_simulated(&network).unwrap();

        assert!(a.ping(b.local_node()).unwrap());
        assert!(b.routing_tree().unwrap().contains(a.id()));

        let gone = b.local_node();
        b.shutdown();

        assert!(!a.ping(gone).unwrap());
    }

    /// Shares its values with the test through a channel.
    #[derive(Debug)]
    struct ForwardingStore {
        inner: MemoryStore,
        stored: Sender<Id>,
    }

    impl DataStore for ForwardingStore {
        fn store(&mut self, key: Bytes, key_hash: Id, value: Bytes) {
            let _ = self.stored.send(key_hash);
            self.inner.store(key, key_hash, value)
        }

        fn retrieve(&mut self, key_hash: &Id) -> Option<Bytes> {
            self.inner.retrieve(key_hash)
        }

        fn remove(&mut self, key_hash: &Id) -> Option<Bytes> {
            self.inner.remove(key_hash)
        }

        fn len(&self) -> usize {
            self.inner.len()
        }
    }

    #[test]
    fn custom_store() {
        let network = SimulatedNetwork::new();
        let (stored, stored_receiver) = flume::unbounded();

        let (socket, inbound) = network.connect(None).unwrap();
        let holder = Dht::with_store(
            fast().config().clone(),
            Box::new(socket),
            inbound,
            Box::new(ForwardingStore {
                inner: MemoryStore::default(),
                stored,
            }),
        )
        .unwrap();

        let writer = fast().build_simulated(&network).unwrap();
        writer.join(&[holder.local_node()]).unwrap();

        let stored_at = writer.store(b"key", b"value").unwrap();
        assert_eq!(stored_at.len(), 1);

        let key_hash = stored_receiver
            .recv_timeout(Duration::from_secs(1))
            .unwrap();
        assert_eq!(key_hash, hash_key(b"key", 160));
        assert_eq!(holder.info().unwrap().stored_values(), 1);
        assert_eq!(holder.get(b"key").unwrap(), Some(Bytes::from_static(b"value")));
    }

    #[test]
    fn join_lonely_seed() {
        let network = SimulatedNetwork::new();
        let a = fast().build_simulated(&network).unwrap();
        let b = fast().build_simulated(&network).unwrap();

        let closest = b.join(&[a.local_node()]).unwrap();

        assert_eq!(closest.len(), 1);
        assert!(closest[0].same_node(&a.local_node()));
        assert!(a.routing_tree().unwrap().contains(b.id()));
    }

    #[test]
    fn find_node_on_testnet() {
        let testnet = Testnet::with_builder(20, fast().k(5)).unwrap();

        let client = fast().k(5).build_simulated(&testnet.network).unwrap();
        client.join(&testnet.bootstrap).unwrap();

        let target = *testnet.nodes[7].id();
        let closest = client.find_node(target).unwrap();

        assert_eq!(closest.len(), 5);
        assert_eq!(closest[0].id, target);
        for pair in closest.windows(2) {
            assert!(pair[0].distance(&target) < pair[1].distance(&target));
        }
    }

    #[test]
    fn store_and_get() {
        let testnet = Testnet::with_builder(10, fast()).unwrap();

        let a = fast().build_simulated(&testnet.network).unwrap();
        a.join(&testnet.bootstrap).unwrap();
        let b = fast().build_simulated(&testnet.network).unwrap();
        b.join(&testnet.bootstrap).unwrap();

        let stored_at = a.store(b"key", b"Hello World!").unwrap();
        assert!(!stored_at.is_empty());

        // Stores are fire and forget, give them a moment to land.
        thread::sleep(Duration::from_millis(50));

        assert_eq!(
            b.get(b"key").unwrap(),
            Some(Bytes::from_static(b"Hello World!"))
        );
        assert_eq!(b.get(b"missing").unwrap(), None);
    }
}
