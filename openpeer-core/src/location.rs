// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a peer in the network, compared as an opaque string.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerUri(String);

impl PeerUri {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerUri {
    fn from(uri: &str) -> Self {
        Self(uri.to_string())
    }
}

/// Where a publication lives or where a request is routed to.
///
/// A "local" location is the repository's own process, a "peer" location is
/// one concrete device of a remote contact and a "finder" location is the
/// rendezvous service peers relay through before a direct connection exists.
///
/// Locations order by kind first, then by peer identity, which gives cache
/// keys containing locations a stable total order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Location {
    Local,
    Peer { uri: PeerUri, location_id: String },
    Finder,
}

impl Location {
    pub fn peer(uri: impl Into<PeerUri>, location_id: impl Into<String>) -> Self {
        Self::Peer {
            uri: uri.into(),
            location_id: location_id.into(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }

    pub fn is_finder(&self) -> bool {
        matches!(self, Self::Finder)
    }

    /// Peer identity behind this location, if it is a peer location.
    pub fn peer_uri(&self) -> Option<&PeerUri> {
        match self {
            Self::Peer { uri, .. } => Some(uri),
            _ => None,
        }
    }

    /// True when both locations refer to the same peer, regardless of which
    /// concrete device (location id) of that peer is meant.
    pub fn is_same_peer(&self, other: &Location) -> bool {
        match (self.peer_uri(), other.peer_uri()) {
            (Some(left), Some(right)) => left == right,
            _ => false,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Peer { uri, location_id } => write!(f, "peer:{uri}/{location_id}"),
            Self::Finder => write!(f, "finder"),
        }
    }
}

/// Connection state of a peer location as reported by the transport layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    /// Disconnecting and disconnected peers are treated alike: their data
    /// enters the expiry grace window.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnecting | Self::Disconnected)
    }
}
