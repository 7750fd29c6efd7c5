//! # revsync Testkit
//!
//! Test utilities for revsync.
//!
//! This crate provides:
//! - [`MemoryRemote`], an in-process remote database with fault injection
//! - Store fixtures and a fast replicator configuration
//! - Property-based generators for edit scripts
//!
//! ## Usage
//!
//! ```rust,ignore
//! use revsync_testkit::prelude::*;
//!
//! let remote = MemoryRemote::new("db");
//! let local = local_store("local");
//! let replicator = Replicator::builder(local, Arc::new(remote.clone()),
//!     test_config(remote.endpoint(), Direction::PushAndPull)).build()?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod remote;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::remote::*;
}

pub use fixtures::*;
pub use generators::*;
pub use remote::{MemoryRemote, NamedFilter, Route};
