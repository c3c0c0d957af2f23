//! Miscellaneous common structs used throughout the library.

mod bucket;
mod closest_nodes;
mod id;
pub mod messages;
mod node;
mod routing_tree;
mod store;

pub use bucket::*;
pub use closest_nodes::*;
pub use id::*;
pub use messages::*;
pub use node::*;
pub use routing_tree::*;
pub use store::*;
