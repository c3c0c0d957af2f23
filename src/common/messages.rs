//! Serialize and deserialize Kademlia RPC messages.

mod internal;

use std::fmt::{self, Display, Formatter};
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::Bytes;

use crate::common::{Id, Node, ID_SIZE};
use crate::{Error, Result};

const NODE4_SIZE: usize = ID_SIZE + 6;

#[derive(Debug, Clone)]
pub struct Message {
    /// Transaction Id, echoed by the reply to a query.
    pub xid: Id,

    /// The sender, as it declares itself.
    pub source: Node,

    pub body: MessageBody,
}

#[derive(Debug, Clone)]
pub enum MessageBody {
    Ping,
    Pong,
    FindNode {
        target: Id,
    },
    ReturnNode {
        nodes: Vec<Node>,
    },
    FindValue {
        key: Bytes,
        key_hash: Id,
    },
    ReturnValue(ValueResponse),
    Store {
        key: Bytes,
        key_hash: Id,
        value: Bytes,
    },
}

#[derive(Debug, Clone)]
/// Payload of a [MessageBody::ReturnValue].
pub enum ValueResponse {
    Found(Bytes),
    /// The responder doesn't have the value, these are the closest nodes it knows.
    NotFound(Vec<Node>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Pong,
    FindNode,
    ReturnNode,
    FindValue,
    ReturnValue,
    Store,
}

impl MessageKind {
    /// Queries that open a transaction and wait for a reply.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            MessageKind::Ping | MessageKind::FindNode | MessageKind::FindValue
        )
    }

    pub fn is_query(&self) -> bool {
        matches!(
            self,
            MessageKind::Ping | MessageKind::FindNode | MessageKind::FindValue | MessageKind::Store
        )
    }

    /// The reply kind that resolves a query of this kind.
    pub fn reply_kind(&self) -> Option<MessageKind> {
        match self {
            MessageKind::Ping => Some(MessageKind::Pong),
            MessageKind::FindNode => Some(MessageKind::ReturnNode),
            MessageKind::FindValue => Some(MessageKind::ReturnValue),
            _ => None,
        }
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::FindNode => "find_node",
            MessageKind::ReturnNode => "return_node",
            MessageKind::FindValue => "find_value",
            MessageKind::ReturnValue => "return_value",
            MessageKind::Store => "store",
        };

        f.write_str(name)
    }
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Ping => MessageKind::Ping,
            MessageBody::Pong => MessageKind::Pong,
            MessageBody::FindNode { .. } => MessageKind::FindNode,
            MessageBody::ReturnNode { .. } => MessageKind::ReturnNode,
            MessageBody::FindValue { .. } => MessageKind::FindValue,
            MessageBody::ReturnValue(_) => MessageKind::ReturnValue,
            MessageBody::Store { .. } => MessageKind::Store,
        }
    }
}

impl Message {
    pub fn new(xid: Id, source: Node, body: MessageBody) -> Message {
        Message { xid, source, body }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    fn into_serde_message(self) -> internal::KrpcMessage {
        internal::KrpcMessage {
            transaction_id: self.xid.0,
            id: self.source.id.0,
            ip: sockaddr_to_bytes(&self.source.address),
            variant: match self.body {
                MessageBody::Ping => internal::KrpcVariant::Ping,
                MessageBody::Pong => internal::KrpcVariant::Pong,
                MessageBody::FindNode { target } => internal::KrpcVariant::FindNode {
                    arguments: internal::FindNodeArguments { target: target.0 },
                },
                MessageBody::ReturnNode { nodes } => internal::KrpcVariant::ReturnNode {
                    arguments: internal::ReturnNodeArguments {
                        nodes: nodes4_to_bytes(&nodes).into(),
                    },
                },
                MessageBody::FindValue { key, key_hash } => internal::KrpcVariant::FindValue {
                    arguments: internal::FindValueArguments {
                        key: key.to_vec().into(),
                        target: key_hash.0,
                    },
                },
                MessageBody::ReturnValue(response) => internal::KrpcVariant::ReturnValue {
                    arguments: match response {
                        ValueResponse::Found(value) => internal::ReturnValueArguments {
                            v: Some(value.to_vec().into()),
                            nodes: None,
                        },
                        ValueResponse::NotFound(nodes) => internal::ReturnValueArguments {
                            v: None,
                            nodes: Some(nodes4_to_bytes(&nodes).into()),
                        },
                    },
                },
                MessageBody::Store {
                    key,
                    key_hash,
                    value,
                } => internal::KrpcVariant::Store {
                    arguments: internal::StoreArguments {
                        key: key.to_vec().into(),
                        target: key_hash.0,
                        v: value.to_vec().into(),
                    },
                },
            },
        }
    }

    fn from_serde_message(msg: internal::KrpcMessage) -> Result<Message> {
        Ok(Message {
            xid: Id(msg.transaction_id),
            source: Node::new(Id(msg.id), bytes_to_sockaddr(msg.ip)?),
            body: match msg.variant {
                internal::KrpcVariant::Ping => MessageBody::Ping,
                internal::KrpcVariant::Pong => MessageBody::Pong,
                internal::KrpcVariant::FindNode { arguments } => MessageBody::FindNode {
                    target: Id(arguments.target),
                },
                internal::KrpcVariant::ReturnNode { arguments } => MessageBody::ReturnNode {
                    nodes: bytes_to_nodes4(&arguments.nodes)?,
                },
                internal::KrpcVariant::FindValue { arguments } => MessageBody::FindValue {
                    key: Bytes::from(arguments.key),
                    key_hash: Id(arguments.target),
                },
                internal::KrpcVariant::ReturnValue { arguments } => {
                    MessageBody::ReturnValue(match (arguments.v, arguments.nodes) {
                        (Some(v), None) => ValueResponse::Found(Bytes::from(v)),
                        (None, Some(nodes)) => ValueResponse::NotFound(bytes_to_nodes4(nodes)?),
                        _ => {
                            return Err(Error::MalformedMessage(
                                "return_value needs exactly one of a value or nodes",
                            ))
                        }
                    })
                }
                internal::KrpcVariant::Store { arguments } => MessageBody::Store {
                    key: Bytes::from(arguments.key),
                    key_hash: Id(arguments.target),
                    value: Bytes::from(arguments.v),
                },
            },
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.clone().into_serde_message().to_bytes()?)
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message> {
        Message::from_serde_message(internal::KrpcMessage::from_bytes(bytes.as_ref())?)
    }
}

fn bytes_to_sockaddr<T: AsRef<[u8]>>(bytes: T) -> Result<SocketAddrV4> {
    let bytes = bytes.as_ref();

    if bytes.len() != 6 {
        return Err(Error::MalformedMessage("wrong number of bytes for address"));
    }

    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);

    Ok(SocketAddrV4::new(ip, port))
}

pub fn sockaddr_to_bytes(sockaddr: &SocketAddrV4) -> [u8; 6] {
    let mut bytes = [0_u8; 6];

    bytes[..4].copy_from_slice(&sockaddr.ip().octets());
    bytes[4..].copy_from_slice(&sockaddr.port().to_be_bytes());

    bytes
}

fn nodes4_to_bytes(nodes: &[Node]) -> Vec<u8> {
    let mut vec = Vec::with_capacity(NODE4_SIZE * nodes.len());

    for node in nodes {
        vec.extend_from_slice(node.id.as_bytes());
        vec.extend_from_slice(&sockaddr_to_bytes(&node.address));
    }

    vec
}

fn bytes_to_nodes4<T: AsRef<[u8]>>(bytes: T) -> Result<Vec<Node>> {
    let bytes = bytes.as_ref();

    if bytes.len() % NODE4_SIZE != 0 {
        return Err(Error::MalformedMessage(
            "wrong number of bytes for nodes message",
        ));
    }

    bytes
        .chunks_exact(NODE4_SIZE)
        .map(|chunk| {
            let id = Id::from_bytes(&chunk[..ID_SIZE])?;
            let address = bytes_to_sockaddr(&chunk[ID_SIZE..])?;

            Ok(Node::new(id, address))
        })
        .collect()
}
