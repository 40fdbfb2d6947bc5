/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! The boundary between name resolution and load balancing.
//!
//! Name resolution is the process by which a channel's target is converted
//! into network addresses used by the channel to connect to a service.  The
//! resolver itself lives outside this crate; LB policies only consume the
//! [`ResolverUpdate`]s it produces.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
};

use crate::status::Status;

/// ResolverUpdate contains the current Resolver state relevant to the LB
/// policy.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ResolverUpdate {
    /// The ordered list of resolved addresses, or the error the resolver
    /// encountered while producing it.
    pub addresses: Result<Vec<Address>, Status>,

    /// An optional human-readable note describing context about the
    /// resolution, to be passed along to the LB policy for inclusion in
    /// RPC failure status messages.  For example, a resolver that returns an
    /// empty address list may set this to something like "no DNS entries
    /// found for <name>".
    pub resolution_note: Option<String>,
}

impl ResolverUpdate {
    /// Creates an update carrying the provided addresses.
    pub fn from_addresses(addresses: Vec<Address>) -> Self {
        ResolverUpdate {
            addresses: Ok(addresses),
            resolution_note: None,
        }
    }

    /// Creates an update carrying a resolver error.
    pub fn from_error(status: Status) -> Self {
        ResolverUpdate {
            addresses: Err(status),
            resolution_note: None,
        }
    }

    /// Attaches a resolution note to the update.
    pub fn with_resolution_note(mut self, note: impl Into<String>) -> Self {
        self.resolution_note = Some(note.into());
        self
    }

    pub(crate) fn resolution_note(&self) -> &str {
        self.resolution_note.as_deref().unwrap_or_default()
    }
}

impl Default for ResolverUpdate {
    fn default() -> Self {
        ResolverUpdate::from_addresses(Vec::new())
    }
}

/// An Address is an identifier that indicates how to connect to a server.
///
/// Two addresses are equal when their network type and address string match;
/// attributes do not participate in equality.
#[non_exhaustive]
#[derive(Debug, Clone, Default)]
pub struct Address {
    /// The network type is used to identify what kind of transport to create
    /// when connecting to this address.  Typically TCP_IP_NETWORK_TYPE.
    pub network_type: &'static str,

    /// The address itself is passed to the transport in order to create a
    /// connection to it.
    pub address: String,

    /// Attributes contains arbitrary data about this address intended for
    /// consumption by the subchannel.
    pub attributes: BTreeMap<String, String>,
}

impl Address {
    /// Creates a TCP/IP address from a `host:port` string.
    pub fn new(address: impl Into<String>) -> Self {
        Address {
            network_type: TCP_IP_NETWORK_TYPE,
            address: address.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Returns a copy of this address with the attribute added.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

impl Eq for Address {}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.network_type == other.network_type && self.address == other.address
    }
}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.network_type.hash(state);
        self.address.hash(state);
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network_type, self.address)
    }
}

/// Indicates the address is an IPv4 or IPv6 address that should be connected to
/// via TCP/IP.
pub static TCP_IP_NETWORK_TYPE: &str = "tcp";

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_equality_ignores_attributes() {
        let a = Address::new("1.1.1.1:1").with_attribute("zone", "a");
        let b = Address::new("1.1.1.1:1");
        assert_eq!(a, b);
        assert_ne!(a, Address::new("1.1.1.1:2"));
        assert_eq!(a.to_string(), "tcp:1.1.1.1:1");
    }

    #[test]
    fn resolution_note_defaults_to_empty() {
        let update = ResolverUpdate::from_addresses(vec![]);
        assert_eq!(update.resolution_note(), "");
        let update = update.with_resolution_note("no DNS entries found for foo");
        assert_eq!(update.resolution_note(), "no DNS entries found for foo");
    }
}
