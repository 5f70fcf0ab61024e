//! Group files
//!
//! Just enough of the access-control grammar for permission
//! resolution: parsing a Group file into principals and expanding
//! nested groups into a flat writer set. Lines hold comma- or
//! whitespace-separated items; `#` starts a comment.

use std::collections::{HashSet, VecDeque};

use futures::future::BoxFuture;

use crate::errors::{Error, ErrorKind, Result};
use crate::types::{Parsed, PathName, UserName};

/// The principal that matches every user.
pub const ALL: &str = "all";

/// One item of a Group file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupItem {
    /// A single user.
    User(UserName),
    /// Every user in a domain, written `*@domain`.
    Wildcard(String),
    /// Every user.
    All,
    /// Another Group file to expand.
    Group(PathName),
}

/// Parse the contents of the Group file at `owner_path`. Bare names
/// resolve to sibling groups in the owner's `Group/` directory.
pub fn parse_group(owner_path: &Parsed, contents: &str) -> Result<Vec<GroupItem>> {
    const OP: &str = "access.parse_group";
    let mut items = Vec::new();
    for line in contents.lines() {
        let line = line.split('#').next().unwrap_or("");
        for token in line.split(&[',', ' ', '\t'][..]).filter(|t| !t.is_empty()) {
            if token.eq_ignore_ascii_case(ALL) {
                items.push(GroupItem::All);
            } else if let Some(domain) = token.strip_prefix("*@") {
                if domain.is_empty() || domain.contains('/') {
                    return Err(Error::invalid(OP, format!("malformed wildcard {token:?}"))
                        .with_path(owner_path.path().as_str()));
                }
                items.push(GroupItem::Wildcard(domain.to_ascii_lowercase()));
            } else if token.contains('/') {
                let path = PathName::new(token);
                if !path.is_group_file() {
                    return Err(Error::invalid(OP, format!("{token:?} is not a Group file"))
                        .with_path(owner_path.path().as_str()));
                }
                items.push(GroupItem::Group(Parsed::parse(&path)?.path()));
            } else if token.contains('@') {
                items.push(GroupItem::User(UserName::parse(token)?));
            } else {
                // Bare name: sibling group of the owning user.
                let path = PathName::new(format!("{}/Group/{token}", owner_path.user()));
                items.push(GroupItem::Group(path));
            }
        }
    }
    Ok(items)
}

/// A flat set of allowed principals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterSet {
    all: bool,
    users: HashSet<UserName>,
    domains: HashSet<String>,
}

impl WriterSet {
    /// True iff the set admits `user`: the `all` sentinel, an exact
    /// member, or a `*@domain` wildcard over the user's domain.
    pub fn allows(&self, user: &UserName) -> bool {
        self.all || self.users.contains(user) || self.domains.contains(user.domain())
    }

    /// True iff no principal is admitted.
    pub fn is_empty(&self) -> bool {
        !self.all && self.users.is_empty() && self.domains.is_empty()
    }
}

/// Expand the Group file at `root` into a flat writer set.
///
/// `fetch` reads a group file's bytes, typically through the read
/// pipeline. Nested groups are followed breadth-first with a visited
/// set, so reference cycles terminate. A nested group that has
/// disappeared is skipped; any other fetch failure aborts the
/// expansion.
pub async fn expand<F>(root: &PathName, fetch: F) -> Result<WriterSet>
where
    F: Fn(PathName) -> BoxFuture<'static, Result<Vec<u8>>>,
{
    let mut set = WriterSet::default();
    let mut work = VecDeque::new();
    let mut visited = HashSet::new();
    work.push_back(root.clone());
    visited.insert(root.clone());

    while let Some(path) = work.pop_front() {
        let parsed = Parsed::parse(&path)?;
        let contents = match fetch(path.clone()).await {
            Ok(bytes) => bytes,
            Err(e) if e.is(ErrorKind::NotExist) && path != *root => {
                log::warn!("group {path} referenced but missing, skipping");
                continue;
            }
            Err(e) => return Err(e),
        };
        let text = String::from_utf8_lossy(&contents).into_owned();
        for item in parse_group(&parsed, &text)? {
            match item {
                GroupItem::User(user) => {
                    set.users.insert(user);
                }
                GroupItem::Wildcard(domain) => {
                    set.domains.insert(domain);
                }
                GroupItem::All => set.all = true,
                GroupItem::Group(nested) => {
                    if visited.insert(nested.clone()) {
                        work.push_back(nested);
                    }
                }
            }
        }
    }
    Ok(set)
}
