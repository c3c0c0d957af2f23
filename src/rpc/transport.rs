//! Datagram transports carrying encoded messages between peers.

use std::fmt::Debug;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, Sender};
use tracing::{debug, trace};

use crate::Result;

const MTU: usize = 2048;
/// How long the UDP reader blocks before checking if anyone is still listening.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
/// An inbound datagram and the address it came from.
pub struct Datagram {
    pub from: SocketAddrV4,
    pub bytes: Bytes,
}

/// Best-effort, unordered delivery of datagrams.
///
/// Inbound datagrams arrive on the [Receiver] handed out with the transport.
pub trait Transport: Send + Debug {
    /// The address peers can reach this transport at.
    fn local_addr(&self) -> SocketAddrV4;

    fn send(&self, to: SocketAddrV4, bytes: &[u8]) -> Result<()>;
}

#[derive(Debug)]
/// A [Transport] over a [UdpSocket].
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddrV4,
}

impl UdpTransport {
    /// Bind a UDP socket and spawn a thread reading from it.
    ///
    /// The thread exits once the returned receiver is dropped.
    pub fn bind(address: SocketAddrV4) -> Result<(Self, Receiver<Datagram>)> {
        let socket = UdpSocket::bind(address)?;

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(addr) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    format!("UdpTransport does not support Ipv6 {}", addr),
                )
                .into())
            }
        };

        let reader = socket.try_clone()?;
        reader.set_read_timeout(Some(READ_TIMEOUT))?;

        let (sender, receiver) = flume::unbounded();

        thread::Builder::new()
            .name(format!("kadtrie-udp-{}", local_addr.port()))
            .spawn(move || read_loop(reader, sender))?;

        Ok((Self { socket, local_addr }, receiver))
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    fn send(&self, to: SocketAddrV4, bytes: &[u8]) -> Result<()> {
        self.socket.send_to(bytes, to)?;
        Ok(())
    }
}

fn read_loop(socket: UdpSocket, sender: Sender<Datagram>) {
    let mut buf = [0_u8; MTU];

    while !sender.is_disconnected() {
        match socket.recv_from(&mut buf) {
            Ok((amt, SocketAddr::V4(from))) => {
                if from.port() == 0 {
                    trace!(context = "socket_validation", "Datagram from port 0");
                    continue;
                }

                let datagram = Datagram {
                    from,
                    bytes: Bytes::copy_from_slice(&buf[..amt]),
                };

                if sender.send(datagram).is_err() {
                    break;
                }
            }
            Ok((_, SocketAddr::V6(_))) => {
                trace!(context = "socket_validation", "Received IPv6 packet");
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(error) => {
                debug!(context = "socket_error", ?error, "recv_from failed");
            }
        }
    }

    trace!("UDP reader stopped");
}
