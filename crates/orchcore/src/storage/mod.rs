mod base;
mod memory;

pub use base::{Criteria, Storage};
pub use memory::{MemoryStore, StoreSnapshot};
