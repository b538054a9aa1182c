//! Per-asset cache keyed by content hash.
//!
//! Holds registry metadata, thumbnail, example media and notes for every
//! identified asset. One folder per hash, so entries can be inspected or
//! backed up with ordinary tools and a damaged entry never affects another.

mod entry;
mod store;

pub use entry::{CacheEntry, CacheEntryUpdate, Notes};
pub use store::{CacheStore, FileCacheStore};
