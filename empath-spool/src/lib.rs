#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

pub mod backends;
pub mod config;
pub mod controller;
pub mod error;
pub mod spool;
pub mod r#trait;
pub mod types;

pub use backends::{
    FileBackingStore, FileBackingStoreBuilder, MemoryBackingStore, TestBackingStore,
};
pub use config::{MemoryConfig, SpoolConfig, SpoolType};
pub use error::{Result, SerializationError, SpoolError, ValidationError};
pub use r#trait::BackingStore;
pub use spool::{FileSpool, MemorySpool, Spool, TestSpool};
pub use types::SpooledMessageId;
