//! API implementation submodules.
//!
//! Each submodule contains `impl AtelierApi` blocks that extend the public
//! API with one area of functionality. The struct itself lives in `lib.rs`.

mod builder;
mod embedded;
mod entries;
mod tasks;

pub use builder::AtelierApiBuilder;
