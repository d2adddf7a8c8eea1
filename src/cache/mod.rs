//! Versioned cache storage for pre-cached responses.
//!
//! This module models the host's cache storage:
//! - Any number of named cache stores can exist side by side
//! - Each store maps request identity to a stored response
//! - Whole stores are created, enumerated and deleted by name
//! - Stores are populated in atomic batches
//! - The version currently in control is recorded alongside the stores

mod storage;
mod traits;

pub use storage::SqliteStorage;
pub use traits::CacheStorage;
