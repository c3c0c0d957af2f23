//! In-memory network for running many peers in one process.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use flume::{Receiver, Sender};
use rand::Rng;
use tracing::trace;

use crate::rpc::transport::{Datagram, Transport};
use crate::{Error, Result};

const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;

#[derive(Debug, Clone, Default)]
/// An in-memory network delivering datagrams between connected addresses.
///
/// Datagrams to unknown addresses are silently dropped.
pub struct SimulatedNetwork {
    peers: Arc<RwLock<HashMap<SocketAddrV4, Sender<Datagram>>>>,
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an address on this network, a random localhost address if
    /// `None`.
    pub fn connect(
        &self,
        address: Option<SocketAddrV4>,
    ) -> Result<(SimulatedSocket, Receiver<Datagram>)> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());

        let address = match address {
            Some(address) => {
                if peers.contains_key(&address) {
                    return Err(Error::AddressInUse(address));
                }
                address
            }
            None => {
                let mut rng = rand::thread_rng();

                loop {
                    let address = SocketAddrV4::new(
                        Ipv4Addr::new(127, rng.gen(), rng.gen(), rng.gen_range(1..=254)),
                        rng.gen_range(EPHEMERAL_PORTS),
                    );

                    if !peers.contains_key(&address) {
                        break address;
                    }
                }
            }
        };

        let (sender, receiver) = flume::unbounded();
        peers.insert(address, sender);

        Ok((
            SimulatedSocket {
                network: self.clone(),
                address,
            },
            receiver,
        ))
    }

    /// Remove an address, closing its inbound channel.
    pub fn disconnect(&self, address: &SocketAddrV4) {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(address);
    }

    /// Number of connected addresses.
    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_connected(&self, address: &SocketAddrV4) -> bool {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(address)
    }

    fn deliver(&self, from: SocketAddrV4, to: SocketAddrV4, bytes: &[u8]) {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());

        match peers.get(&to) {
            Some(sender) => {
                let _ = sender.send(Datagram {
                    from,
                    bytes: Bytes::copy_from_slice(bytes),
                });
            }
            None => trace!(?from, ?to, "Dropped datagram to unknown address"),
        }
    }
}

#[derive(Debug)]
/// A [Transport] connected to a [SimulatedNetwork], disconnected on drop.
pub struct SimulatedSocket {
    network: SimulatedNetwork,
    address: SocketAddrV4,
}

impl Transport for SimulatedSocket {
    fn local_addr(&self) -> SocketAddrV4 {
        self.address
    }

    fn send(&self, to: SocketAddrV4, bytes: &[u8]) -> Result<()> {
        self.network.deliver(self.address, to, bytes);
        Ok(())
    }
}

impl Drop for SimulatedSocket {
    fn drop(&mut self) {
        self.network.disconnect(&self.address);
    }
}
