//! Backing store implementations
//!
//! - `memory`: in-process map, for tests and throwaway deployments
//! - `file`: one bincode file per envelope in a spool directory

pub mod file;
pub mod memory;

pub use file::FileBackingStore;
pub use memory::MemoryBackingStore;
