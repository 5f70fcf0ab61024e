//! Error model shared by every Lattice component
//!
//! All operations return an [`Error`] carrying a closed failure class
//! ([`ErrorKind`]), the name of the operation that failed, an optional
//! path or user the failure is about, and a human-readable cause. No
//! error swallows its underlying cause.

use std::fmt;

use thiserror::Error as ThisError;

use crate::types::DirEntry;

/// Closed set of failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ThisError)]
pub enum ErrorKind {
    /// Malformed path, unknown packing tag, unknown transport, duplicate
    /// registration.
    #[error("invalid argument")]
    Invalid,
    /// The caller is not allowed to perform the operation.
    #[error("permission denied")]
    Permission,
    /// The path has no entry, or the reference is absent from every
    /// reachable store.
    #[error("item does not exist")]
    NotExist,
    /// An intermediate link was followed but its target has vanished.
    #[error("broken link")]
    BrokenLink,
    /// Network error, checksum mismatch, or filesystem failure.
    #[error("I/O error")]
    Io,
    /// Invariant violation inside the runtime or a misbehaving server.
    #[error("internal inconsistency")]
    Internal,
    /// The caller must not learn whether the resource exists.
    #[error("information withheld")]
    Private,
}

fn render(
    f: &mut fmt::Formatter<'_>,
    op: &str,
    path: &Option<String>,
    kind: &ErrorKind,
    detail: &str,
) -> fmt::Result {
    write!(f, "{op}: ")?;
    if let Some(path) = path {
        write!(f, "{path}: ")?;
    }
    write!(f, "{kind}")?;
    if !detail.is_empty() {
        write!(f, ": {detail}")?;
    }
    Ok(())
}

/// Error returned by all Lattice operations.
///
/// Carries enough context for an operator to locate the failing
/// path or endpoint. Construct through the per-kind helpers
/// ([`Error::invalid`], [`Error::io`], ...) and attach the subject with
/// [`Error::with_path`].
#[derive(Debug)]
pub struct Error {
    /// Name of the failing operation, e.g. `bind::store_server`.
    pub op: String,
    /// Path, user, or endpoint the failure is about.
    pub path: Option<String>,
    /// Failure class.
    pub kind: ErrorKind,
    /// Human-readable cause.
    pub detail: String,
    /// True for "service unavailable"-class network failures that a
    /// caller may retry.
    transient: bool,
    /// Set when a DirServer asks the caller to continue a lookup at a
    /// link. Never one of the public failure classes; consumed by the
    /// read pipeline.
    follow: bool,
    link: Option<Box<DirEntry>>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render(f, &self.op, &self.path, &self.kind, &self.detail)
    }
}

impl std::error::Error for Error {}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an error of an explicit kind.
    pub fn new(op: impl Into<String>, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            path: None,
            kind,
            detail: detail.into(),
            transient: false,
            follow: false,
            link: None,
        }
    }

    /// Invalid argument: malformed input, unknown tag, duplicate
    /// registration.
    pub fn invalid(op: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(op, ErrorKind::Invalid, detail)
    }

    /// Permission denied.
    pub fn permission(op: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(op, ErrorKind::Permission, detail)
    }

    /// Item does not exist.
    pub fn not_exist(op: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(op, ErrorKind::NotExist, detail)
    }

    /// Broken link: an intermediate link's target has vanished.
    pub fn broken_link(op: impl Into<String>, link_name: impl Into<String>) -> Self {
        Self::new(op, ErrorKind::BrokenLink, "link target has vanished")
            .with_path(link_name)
    }

    /// I/O failure: network, checksum, or filesystem.
    pub fn io(op: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(op, ErrorKind::Io, detail)
    }

    /// I/O failure of the transient "service unavailable" class.
    pub fn unavailable(op: impl Into<String>, detail: impl Into<String>) -> Self {
        let mut e = Self::new(op, ErrorKind::Io, detail);
        e.transient = true;
        e
    }

    /// Invariant violation.
    pub fn internal(op: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(op, ErrorKind::Internal, detail)
    }

    /// The caller must not learn whether the resource exists.
    pub fn private(op: impl Into<String>) -> Self {
        Self::new(op, ErrorKind::Private, "")
    }

    /// Continuation telling the read pipeline to resume a lookup at the
    /// carried link entry. Not a public failure class; a pipeline that
    /// receives one with no entry reports [`ErrorKind::Internal`].
    pub fn follow_link(op: impl Into<String>, link: Option<DirEntry>) -> Self {
        let mut e = Self::new(op, ErrorKind::Internal, "pending link traversal");
        e.follow = true;
        e.link = link.map(Box::new);
        e
    }

    /// Attach the path, user, or endpoint the failure is about.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Override the transient classification, used when aggregating
    /// errors across several candidate servers.
    pub fn with_transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    /// True iff the error is of the given class.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// True for retryable "service unavailable"-class failures.
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    /// True for the link-traversal continuation.
    pub fn is_follow_link(&self) -> bool {
        self.follow
    }

    /// The link entry carried by a link-traversal continuation.
    pub fn link_entry(&self) -> Option<&DirEntry> {
        self.link.as_deref()
    }

    /// Consume the continuation, yielding the carried link entry.
    pub fn into_link_entry(self) -> Option<DirEntry> {
        self.link.map(|b| *b)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::io("io", err.to_string())
    }
}
