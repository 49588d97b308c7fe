// shardmc-common - Shared data model and error taxonomy for the shardmc client
//
// This crate is pure data: items, the operation table, key validation and errors.
// Nothing here touches the network.

pub mod error;
pub mod item;
pub mod key;
pub mod ops;

// Re-export for convenience
pub use error::*;
pub use item::*;
pub use key::*;
pub use ops::*;
