//! # LATTICE - Encrypted Namespace Client Runtime
//!
//! The client-side service runtime of a global, end-to-end-encrypted
//! naming system for user files.
//!
//! ## Architecture
//!
//! - `types`: Endpoints, user names, paths, references, and directory entries
//! - `errors`: The closed error-kind set shared by every component
//! - `service`: Contracts for the three remote service kinds and their dialers
//! - `bind`: The binding switch with its single-flight dialed-service pool
//! - `pack`: Block encoding schemes (plain and sealed)
//! - `client`: The read pipeline with redirect chasing and link traversal
//! - `storecache`: The on-disk LRU byte cache and writeback queue
//! - `access`: Group-file parsing for permission resolution
//! - `perm`: The Group-driven permission gate over a StoreServer

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core data model
pub mod types;

// Error model
pub mod errors;

// Service contracts
pub mod service;

// Binding switch
pub mod bind;

// Block packers
pub mod pack;

// Read pipeline
pub mod client;

// Local byte cache and writeback queue
pub mod storecache;

// Group files
pub mod access;

// Permission gate
pub mod perm;

// Re-export commonly used types
pub use client::Client;
pub use errors::{Error, ErrorKind, Result};
pub use service::{Context, DirServer, KeyServer, Service, StoreServer};
pub use types::{
    DirEntry, Endpoint, Location, PathName, Refdata, Reference, Transport, UserName,
};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
