#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
pub mod common;

#[cfg(feature = "async")]
pub mod async_dht;
mod dht;
mod error;
pub mod rpc;

pub use crate::common::{Id, Node, RoutingSettings, RoutingTree};
pub use bytes::Bytes;
pub use dht::{Dht, DhtBuilder, Testnet};
pub use error::{Error, Result};

pub mod errors {
    //! Errors returned by [crate::Dht] handles.
    pub use super::error::DhtWasShutdown;
}
