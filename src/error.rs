//! Main Crate Error

use std::net::SocketAddrV4;

use crate::common::Id;

#[derive(thiserror::Error, Debug)]
/// Kadtrie crate error enum.
pub enum Error {
    /// Id was not constructed from exactly 20 bytes.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// Id string was not 40 hex characters.
    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),

    /// Id does not fit in the key space of the routing tree.
    #[error("Node id {0} is outside of the {1} bit key space")]
    InvalidNodeId(Id, u8),

    /// Key space width must be between 1 and 160 bits.
    #[error("Invalid key space width: {0} bits")]
    InvalidKeySpace(u8),

    /// The bucket already holds `k` nodes.
    #[error("Bucket is full")]
    BucketFull,

    /// A node was offered to a bucket whose range doesn't contain its id.
    #[error("Node id {id} is outside of bucket range [{min}, {last}]")]
    BucketRangeMismatch { id: Id, min: Id, last: Id },

    /// A bucket range is empty or exceeds the key space.
    #[error("Invalid bucket range [{min}, {last}]")]
    BucketRangeInvalid { min: Id, last: Id },

    /// A simulated address is already connected.
    #[error("Address {0} is already in use")]
    AddressInUse(SocketAddrV4),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    #[error("Failed to parse packet bytes: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    /// Message decoded but is missing or has inconsistent fields.
    #[error("Malformed message: {0}")]
    MalformedMessage(&'static str),

    #[error(transparent)]
    /// The actor thread of a [crate::Dht] node is no longer running.
    DhtWasShutdown(#[from] DhtWasShutdown),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Dht was shutdown")]
/// The actor thread of a [crate::Dht] node is no longer running.
pub struct DhtWasShutdown;
