//! Crash-safe persistence helpers shared by the cache store, the identity
//! index, settings, downloads and the metadata codec.

mod atomic;
mod lock;

pub use atomic::{atomic_copy, atomic_read_json, atomic_write_bytes, atomic_write_json};
pub use lock::KeyedLocks;
