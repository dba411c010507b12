//! Storage seam of the engine
//!
//! The engine never talks to a database directly: it opens readers and
//! exclusive writers through a [`StoreProvider`]. Writers are transactions,
//! every logical write of the engine runs inside exactly one of them.

mod memory;
mod provider;

pub use memory::{MemoryReader, MemoryStore, MemoryWriter};
pub use provider::{
    CapabilityBinding, CapabilityQuery, StoreError, StoreProvider, StoreRead, StoreWrite,
};
