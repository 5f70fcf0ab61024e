//! Path names
//!
//! A path names a file in some user's tree: `user@domain/a/b/c`. The
//! parsed form cleans the path lexically (resolving `.`, `..`, and
//! repeated slashes) without consulting any directory server.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::types::UserName;

/// Textual path name rooted at a user, e.g. `ann@example.com/notes/todo`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathName(String);

impl PathName {
    /// Wrap a string as a path name without validation. Use
    /// [`Parsed::parse`] to validate and clean.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True iff the final path element names an access-control file.
    pub fn is_access_file(&self) -> bool {
        match Parsed::parse(self) {
            Ok(p) => p.nelem() > 0 && p.elem(p.nelem() - 1) == "Access",
            Err(_) => false,
        }
    }

    /// True iff the path lies in the user's `Group/` subtree.
    pub fn is_group_file(&self) -> bool {
        match Parsed::parse(self) {
            Ok(p) => p.nelem() >= 2 && p.elem(0) == "Group",
            Err(_) => false,
        }
    }

    /// True for Access and Group files, whose entries carry extra
    /// integrity requirements on the read path.
    pub fn is_access_controlled(&self) -> bool {
        self.is_access_file() || self.is_group_file()
    }
}

impl fmt::Display for PathName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PathName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PathName {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// A validated, cleaned path: the owning user plus path elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    user: UserName,
    elems: Vec<String>,
}

impl Parsed {
    /// Parse and clean a path name.
    pub fn parse(name: &PathName) -> Result<Self> {
        const OP: &str = "path.parse";
        let s = name.as_str();
        let (user_part, rest) = match s.find('/') {
            Some(i) => (&s[..i], &s[i + 1..]),
            None => (s, ""),
        };
        let user = UserName::parse(user_part)
            .map_err(|e| Error::invalid(OP, e.detail).with_path(s))?;

        let mut elems: Vec<String> = Vec::new();
        for elem in rest.split('/') {
            match elem {
                "" | "." => continue,
                ".." => {
                    // Lexical cleaning only; .. above the root stays at
                    // the root.
                    elems.pop();
                }
                _ => elems.push(elem.to_string()),
            }
        }
        Ok(Self { user, elems })
    }

    /// Build a parsed path directly from a user and elements.
    pub fn from_parts(user: UserName, elems: Vec<String>) -> Self {
        Self { user, elems }
    }

    /// The user owning the tree the path is in.
    pub fn user(&self) -> &UserName {
        &self.user
    }

    /// Number of path elements below the root.
    pub fn nelem(&self) -> usize {
        self.elems.len()
    }

    /// The i-th path element. Panics if out of range, as slices do.
    pub fn elem(&self, i: usize) -> &str {
        &self.elems[i]
    }

    /// All path elements below the root.
    pub fn elems(&self) -> &[String] {
        &self.elems
    }

    /// True iff the path is the user's root.
    pub fn is_root(&self) -> bool {
        self.elems.is_empty()
    }

    /// The path truncated to its first `n` elements.
    pub fn first_n(&self, n: usize) -> Self {
        Self {
            user: self.user.clone(),
            elems: self.elems[..n.min(self.elems.len())].to_vec(),
        }
    }

    /// Element-wise prefix test: true iff `prefix` names this path or
    /// an ancestor of it in the same user's tree.
    pub fn has_prefix(&self, prefix: &Parsed) -> bool {
        self.user == prefix.user
            && self.elems.len() >= prefix.elems.len()
            && self.elems[..prefix.elems.len()] == prefix.elems[..]
    }

    /// The path extended with the given tail elements.
    pub fn with_suffix(&self, tail: &[String]) -> Self {
        let mut elems = self.elems.clone();
        elems.extend(tail.iter().cloned());
        Self {
            user: self.user.clone(),
            elems,
        }
    }

    /// The canonical textual form: `user@domain/` for a root,
    /// `user@domain/a/b` otherwise.
    pub fn path(&self) -> PathName {
        if self.elems.is_empty() {
            PathName::new(format!("{}/", self.user))
        } else {
            PathName::new(format!("{}/{}", self.user, self.elems.join("/")))
        }
    }
}

impl fmt::Display for Parsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path())
    }
}
