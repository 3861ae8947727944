//! CyxShard Storage Backend
//!
//! Provides the durable store the routing engine runs against:
//! - `ShardStore` trait for pluggable stores
//! - `SledStore` for production (multi-tree transactions)
//! - `MemoryStore` for testing, with fault injection

pub mod backend;
pub mod memory;
pub mod sled_backend;

pub use backend::{
    apply_delta, LruCursor, MappingInsert, MappingUpdate, ReassignOutcome, ShardStore,
};
pub use memory::{MemoryStore, StoreOp};
pub use sled_backend::SledStore;
