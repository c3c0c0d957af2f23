//! AsyncDht node.

use std::thread;

use bytes::Bytes;

use crate::{
    common::{Id, Node, RoutingTree},
    dht::{ActorMessage, Dht},
    errors::DhtWasShutdown,
    rpc::Info,
};

impl Dht {
    /// Return an async version of the Dht node.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
///
/// Lookups still block on flume channels internally, so they run on a
/// short lived thread each, and their result is awaited asynchronously.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// This node's [Id].
    pub fn id(&self) -> &Id {
        self.0.id()
    }

    /// The underlying blocking [Dht] handle.
    pub fn as_blocking(&self) -> &Dht {
        &self.0
    }

    /// Information and statistics about this [Dht] node.
    pub async fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.send(ActorMessage::Info(sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// A snapshot of this node's routing tree.
    pub async fn routing_tree(&self) -> Result<RoutingTree, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<RoutingTree>(1);

        self.send(ActorMessage::RoutingTree(sender))?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Stop the actor thread and wait until it is done.
    pub async fn shutdown(&self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        if self.send(ActorMessage::Shutdown(sender)).is_ok() {
            let _ = receiver.recv_async().await;
        }
    }

    /// Async version of [Dht::join].
    pub async fn join(&self, seeds: &[Node]) -> Result<Vec<Node>, DhtWasShutdown> {
        let seeds = seeds.to_vec();

        self.blocking(move |dht| dht.join(&seeds)).await
    }

    /// Async version of [Dht::find_node].
    pub async fn find_node(&self, target: Id) -> Result<Vec<Node>, DhtWasShutdown> {
        self.blocking(move |dht| dht.find_node(target)).await
    }

    /// Async version of [Dht::store].
    pub async fn store(&self, key: &[u8], value: &[u8]) -> Result<Vec<Node>, DhtWasShutdown> {
        let key = Bytes::copy_from_slice(key);
        let value = Bytes::copy_from_slice(value);

        self.blocking(move |dht| dht.store(&key, &value)).await
    }

    /// Async version of [Dht::get].
    pub async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, DhtWasShutdown> {
        let key = Bytes::copy_from_slice(key);

        self.blocking(move |dht| dht.get(&key)).await
    }

    /// Async version of [Dht::ping].
    pub async fn ping(&self, node: Node) -> Result<bool, DhtWasShutdown> {
        self.blocking(move |dht| dht.ping(node)).await
    }

    // === Private Methods ===

    fn send(&self, message: ActorMessage) -> Result<(), DhtWasShutdown> {
        self.0.sender.send(message).map_err(|_| DhtWasShutdown)
    }

    async fn blocking<T, F>(&self, operation: F) -> Result<T, DhtWasShutdown>
    where
        T: Send + 'static,
        F: FnOnce(Dht) -> Result<T, DhtWasShutdown> + Send + 'static,
    {
        let (sender, receiver) = flume::bounded::<Result<T, DhtWasShutdown>>(1);
        let dht = self.0.clone();

        // A thread that could not be spawned drops the sender, which reads
        // as a shutdown below.
        let _ = thread::Builder::new()
            .name("kadtrie-async".to_string())
            .spawn(move || {
                let _ = sender.send(operation(dht));
            });

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)?
    }
}
