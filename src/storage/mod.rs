mod memory;

pub use memory::{ApplyCall, Document, MemoryStore, MemoryStoreConfig};
