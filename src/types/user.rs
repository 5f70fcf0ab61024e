//! User names and user records

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::types::Endpoint;

/// Canonicalized `local@domain` user name.
///
/// Canonicalization lowercases the domain and is idempotent; the local
/// part is case-sensitive and kept as written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserName(String);

impl UserName {
    /// Parse and canonicalize a user name.
    pub fn parse(s: &str) -> Result<Self> {
        const OP: &str = "user.parse";
        let (local, domain) = s
            .rsplit_once('@')
            .ok_or_else(|| Error::invalid(OP, "missing @ sign").with_path(s))?;
        if local.is_empty() {
            return Err(Error::invalid(OP, "missing local part").with_path(s));
        }
        if local.contains('@') {
            return Err(Error::invalid(OP, "multiple @ signs").with_path(s));
        }
        if domain.is_empty() {
            return Err(Error::invalid(OP, "missing domain").with_path(s));
        }
        if domain.contains('/') || domain.contains(char::is_whitespace) {
            return Err(Error::invalid(OP, "malformed domain").with_path(s));
        }
        Ok(Self(format!("{local}@{}", domain.to_ascii_lowercase())))
    }

    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `(local, domain)` halves of the name.
    pub fn split(&self) -> (&str, &str) {
        // The constructor guarantees exactly one separator.
        self.0.rsplit_once('@').unwrap_or((&self.0, ""))
    }

    /// The domain half of the name.
    pub fn domain(&self) -> &str {
        self.split().1
    }
}

impl fmt::Display for UserName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for UserName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A user's record as held by the KeyServer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// The user the record describes.
    pub name: UserName,
    /// Ordered fallback list of DirServer endpoints for this user.
    pub dirs: Vec<Endpoint>,
    /// StoreServer endpoints holding the user's data.
    pub stores: Vec<Endpoint>,
    /// The user's public key, in its textual form.
    pub public_key: String,
}
