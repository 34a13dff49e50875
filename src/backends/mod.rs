//! Implementations of the storage, metadata and state seams.

pub mod local;
pub mod memory;
pub mod rest;

pub use local::{FileStateStore, MemoryStateStore};
pub use memory::{MemoryBackend, StoredSession};
pub use rest::{RestBackend, RestConfig};
