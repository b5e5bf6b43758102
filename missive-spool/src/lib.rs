pub mod backends;
pub mod config;
pub mod error;
pub mod r#trait;

pub use backends::{FileBackingStore, MemoryBackingStore};
pub use config::SpoolConfig;
pub use error::{Result, SerializationError, SpoolError, ValidationError};
pub use r#trait::BackingStore;
