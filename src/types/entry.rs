//! Directory entries, blocks, and content references

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{Error, Result};
use crate::types::{Endpoint, PathName, UserName};

/// Opaque identifier of a content-addressed blob.
///
/// For content the client itself writes, the reference is the SHA-256
/// digest of the bytes as uppercase hex with no separators. A few
/// synthetic references address the local cache rather than a blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference(String);

impl Reference {
    /// Synthetic reference answered by the storecache with a fixed
    /// diagnostic string, touching neither disk nor upstream.
    pub const HEALTH_METADATA: &'static str = "metadata:health";

    /// Synthetic reference whose Get blocks until the writeback queue
    /// is empty.
    pub const FLUSH_WRITEBACKS: &'static str = "metadata:flush-writebacks";

    /// Wrap a string as a reference.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The reference for client-written content: uppercase hex SHA-256
    /// of the bytes.
    pub fn for_data(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hex::encode_upper(hasher.finalize()))
    }

    /// The textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the synthetic cache-control references.
    pub fn is_metadata(&self) -> bool {
        self.0.starts_with("metadata:")
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Reference {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Where a blob lives: an endpoint plus a reference understood by the
/// store at that endpoint. A StoreServer Get may answer with a list of
/// these instead of bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// The store to ask.
    pub endpoint: Endpoint,
    /// The reference to ask it for.
    pub reference: Reference,
}

impl Location {
    /// Create a location.
    pub fn new(endpoint: Endpoint, reference: Reference) -> Self {
        Self { endpoint, reference }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.endpoint, self.reference)
    }
}

/// Metadata a StoreServer returns about a reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refdata {
    /// The reference the data lives under.
    pub reference: Reference,
    /// True forbids caching the data anywhere.
    pub volatile: bool,
    /// How long the data may be cached, if bounded.
    pub duration: Option<Duration>,
}

impl Refdata {
    /// Refdata for cacheable content.
    pub fn cacheable(reference: Reference) -> Self {
        Self {
            reference,
            volatile: false,
            duration: None,
        }
    }

    /// Refdata for content that must not be cached.
    pub fn volatile(reference: Reference) -> Self {
        Self {
            reference,
            volatile: true,
            duration: None,
        }
    }
}

/// Encoding scheme applied to a file's blocks, identified by a small
/// integer tag on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Packing {
    /// Cleartext blocks with per-block integrity checksums.
    Plain,
    /// AES-256-GCM sealed blocks keyed by the caller's secret.
    Sealed,
}

impl Packing {
    /// The wire tag.
    pub fn tag(&self) -> u8 {
        match self {
            Packing::Plain => 0,
            Packing::Sealed => 2,
        }
    }
}

impl fmt::Display for Packing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packing::Plain => f.write_str("plain"),
            Packing::Sealed => f.write_str("sealed"),
        }
    }
}

impl TryFrom<u8> for Packing {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Packing::Plain),
            2 => Ok(Packing::Sealed),
            _ => Err(Error::invalid("packing.parse", format!("unknown packing tag {tag}"))),
        }
    }
}

/// What a directory entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attribute {
    /// A plain file.
    Regular,
    /// A directory.
    Directory,
    /// A link; the entry's target names another path and the entry has
    /// no blocks.
    Link,
    /// An entry whose blocks the caller is not entitled to see.
    Incomplete,
}

/// One contiguous span of a file's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirBlock {
    /// Byte offset of the block within the file's plaintext.
    pub offset: i64,
    /// Plaintext size of the block in bytes.
    pub size: i64,
    /// Where the block's ciphertext lives.
    pub location: Location,
    /// Per-block packing data, e.g. a checksum or nonce.
    pub packdata: Vec<u8>,
}

/// Metadata record for one file, directory, or link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// The entry's name as looked up.
    pub name: PathName,
    /// The name the writer signed; differs from `name` below links.
    pub signed_name: PathName,
    /// The user who wrote the entry.
    pub writer: UserName,
    /// Encoding scheme of the entry's blocks.
    pub packing: Packing,
    /// What the entry describes.
    pub attr: Attribute,
    /// Ordered content blocks; empty for directories and links.
    pub blocks: Vec<DirBlock>,
    /// Entry-level packing data.
    pub packdata: Vec<u8>,
    /// Target path, for links only.
    pub link: Option<PathName>,
    /// Monotonic version counter for the entry.
    pub sequence: i64,
    /// Modification time, seconds since the epoch.
    pub time: i64,
}

impl DirEntry {
    /// A minimal regular-file entry; blocks are appended by the packer.
    pub fn regular(name: PathName, writer: UserName, packing: Packing) -> Self {
        Self {
            signed_name: name.clone(),
            name,
            writer,
            packing,
            attr: Attribute::Regular,
            blocks: Vec::new(),
            packdata: Vec::new(),
            link: None,
            sequence: 0,
            time: 0,
        }
    }

    /// A link entry pointing at `target`.
    pub fn link(name: PathName, writer: UserName, target: PathName) -> Self {
        Self {
            signed_name: name.clone(),
            name,
            writer,
            packing: Packing::Plain,
            attr: Attribute::Link,
            blocks: Vec::new(),
            packdata: Vec::new(),
            link: Some(target),
            sequence: 0,
            time: 0,
        }
    }

    /// A directory entry.
    pub fn directory(name: PathName, writer: UserName) -> Self {
        Self {
            signed_name: name.clone(),
            name,
            writer,
            packing: Packing::Plain,
            attr: Attribute::Directory,
            blocks: Vec::new(),
            packdata: Vec::new(),
            link: None,
            sequence: 0,
            time: 0,
        }
    }

    /// True for link entries.
    pub fn is_link(&self) -> bool {
        self.attr == Attribute::Link
    }

    /// True for directory entries.
    pub fn is_dir(&self) -> bool {
        self.attr == Attribute::Directory
    }

    /// True for entries whose blocks are withheld.
    pub fn is_incomplete(&self) -> bool {
        self.attr == Attribute::Incomplete
    }
}
