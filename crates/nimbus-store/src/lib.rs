//! # nimbus-store: block storage providers
//!
//! A provider maps integer block ids to fixed-size byte blobs. The
//! block-map layer in `nimbus-block` drives providers through the
//! [`BlockProvider`] trait and never assumes anything about the
//! backing medium beyond the two-call contract.
//!
//! Implementations:
//!
//! - [`LocalProvider`] — one file per block in a local directory
//! - [`DropboxProvider`] — one Dropbox file per block, HTTP content API
//! - [`MemoryProvider`] — in-process map, for tests and benchmarks
//!
//! A block that was never written reads back as all zeros; providers
//! translate their own "object absent" signal into a zero-filled
//! block rather than an error.

#![warn(missing_docs)]

pub mod dropbox;
pub mod error;
pub mod local;
pub mod memory;
pub mod provider;

pub use dropbox::DropboxProvider;
pub use error::{Error, Result};
pub use local::LocalProvider;
pub use memory::MemoryProvider;
pub use provider::{BlockProvider, block_object_name, zero_block};
