//! Service endpoints and transports

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// How a remote service is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    /// No transport assigned; such endpoints are never dialed.
    Unassigned,
    /// In-process service, used by tests and local fixtures.
    InProcess,
    /// The production RPC transport.
    Remote,
    /// Plain HTTPS content fetch.
    Https,
    /// Out-of-process plugin transport.
    Plugin,
}

impl Transport {
    fn tag(&self) -> &'static str {
        match self {
            Transport::Unassigned => "unassigned",
            Transport::InProcess => "inprocess",
            Transport::Remote => "remote",
            Transport::Https => "https",
            Transport::Plugin => "plugin",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unassigned" | "" => Ok(Transport::Unassigned),
            "inprocess" => Ok(Transport::InProcess),
            "remote" => Ok(Transport::Remote),
            "https" => Ok(Transport::Https),
            "plugin" => Ok(Transport::Plugin),
            _ => Err(Error::invalid("transport.parse", format!("unknown transport {s:?}"))),
        }
    }
}

/// Network location of one remote service: a transport plus a
/// transport-specific address. Two endpoints are equal iff both fields
/// are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Transport used to reach the service.
    pub transport: Transport,
    /// Transport-specific address, e.g. `store.example.com:443`.
    pub net_addr: String,
}

impl Endpoint {
    /// Create an endpoint from a transport and address.
    pub fn new(transport: Transport, net_addr: impl Into<String>) -> Self {
        Self {
            transport,
            net_addr: net_addr.into(),
        }
    }

    /// The endpoint that is never dialed.
    pub fn unassigned() -> Self {
        Self::new(Transport::Unassigned, "")
    }

    /// Parse the textual `transport,addr` form. A bare transport with
    /// no comma is accepted and leaves the address empty.
    pub fn parse(s: &str) -> Result<Self> {
        let (transport, addr) = match s.split_once(',') {
            Some((t, a)) => (t, a),
            None => (s, ""),
        };
        if addr.contains('\n') {
            return Err(Error::invalid("endpoint.parse", "address contains a newline").with_path(s));
        }
        Ok(Self {
            transport: transport.parse()?,
            net_addr: addr.to_string(),
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.net_addr.is_empty() {
            write!(f, "{}", self.transport)
        } else {
            write!(f, "{},{}", self.transport, self.net_addr)
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
