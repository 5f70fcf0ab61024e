//! Core data model
//!
//! Value types shared by every component: endpoints and transports,
//! canonicalized user names, parsed path names, content references,
//! directory entries, and the packing tags that select an encoding
//! scheme.

mod endpoint;
mod entry;
mod path;
mod user;

pub use endpoint::{Endpoint, Transport};
pub use entry::{
    Attribute, DirBlock, DirEntry, Location, Packing, Refdata, Reference,
};
pub use path::{Parsed, PathName};
pub use user::{UserName, UserRecord};
