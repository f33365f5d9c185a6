// SPDX-License-Identifier: MIT OR Apache-2.0

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::location::{Location, PeerUri};

/// Payload encoding of a publication.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Binary,
    Json,
}

/// Permission mode of one relationship entry, interpreted against the cached
/// relationship document of the same name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Grant every contact listed in the relationship document.
    All,
    /// Revoke every contact listed in the relationship document.
    None,
    /// Grant the explicit contacts, restricted to those the relationship
    /// document actually lists.
    Add,
    /// Revoke the explicit contacts, restricted to those the relationship
    /// document lists and which are currently granted.
    Remove,
    /// Same grant semantics as `Add`.
    Some,
}

/// Permission mode plus the explicit peer list it applies to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationshipEntry {
    pub permission: Permission,
    pub contacts: Vec<PeerUri>,
}

impl RelationshipEntry {
    pub fn new(permission: Permission, contacts: impl IntoIterator<Item = PeerUri>) -> Self {
        Self {
            permission,
            contacts: contacts.into_iter().collect(),
        }
    }
}

/// Relationship entries keyed by relationship-document name.
///
/// Resolution walks entries in name order; the ordered map is what makes
/// layered grant/revoke entries deterministic.
pub type Relationships = BTreeMap<String, RelationshipEntry>;

/// Identity and permission descriptor of a publication.
///
/// Standalone instances double as query keys for cache lookups and fetch
/// requests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublicationMetaData {
    /// Hierarchical path name, the primary key component.
    pub name: String,
    pub mime_type: String,
    pub encoding: Encoding,
    /// Monotonic per-lineage counter, starting at 1. Version 0 in a query
    /// means "whatever is current".
    pub version: u64,
    /// Version this update was computed against; 0 means full document.
    pub base_version: u64,
    /// Publish-epoch discriminator. Versions from different lineages are
    /// never comparable.
    pub lineage: u64,
    pub creator: Location,
    pub published_to: Location,
    pub relationships: Relationships,
    /// Expiry hints in UNIX epoch seconds; unset means no constraint from
    /// that source.
    pub expires: Option<u64>,
    pub cache_expires: Option<u64>,
}

impl PublicationMetaData {
    /// Builds a query descriptor for cache lookups and fetches.
    pub fn query(
        name: impl Into<String>,
        creator: Location,
        published_to: Location,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: String::new(),
            encoding: Encoding::Json,
            version: 0,
            base_version: 0,
            lineage: 0,
            creator,
            published_to,
            relationships: Relationships::new(),
            expires: None,
            cache_expires: None,
        }
    }

    /// Stable cache identity of this publication.
    pub fn key(&self) -> PublicationKey {
        PublicationKey {
            name: self.name.clone(),
            creator: self.creator.clone(),
            published_to: self.published_to.clone(),
            lineage: self.lineage,
        }
    }

    /// Identity equality, ignoring volatile fields such as the version.
    ///
    /// `ignore_lineage` permits matching across publish epochs, which
    /// long-lived subscriptions rely on.
    pub fn is_matching(&self, other: &Self, ignore_lineage: bool) -> bool {
        self.name == other.name
            && self.creator == other.creator
            && self.published_to == other.published_to
            && (ignore_lineage || self.lineage == other.lineage)
    }

    /// Identity total order, for sorted cache traversal.
    pub fn is_less_than(&self, other: &Self, ignore_lineage: bool) -> bool {
        self.compare(other, ignore_lineage) == Ordering::Less
    }

    fn compare(&self, other: &Self, ignore_lineage: bool) -> Ordering {
        let ordering = self
            .name
            .cmp(&other.name)
            .then_with(|| self.creator.cmp(&other.creator))
            .then_with(|| self.published_to.cmp(&other.published_to));
        if ignore_lineage {
            ordering
        } else {
            ordering.then_with(|| self.lineage.cmp(&other.lineage))
        }
    }

    /// Effective expiry: the earlier of the two hints, with an unset hint
    /// imposing no constraint. Both unset means the entry never expires.
    pub fn effective_expiry(&self) -> Option<u64> {
        match (self.expires, self.cache_expires) {
            (None, None) => None,
            (Some(expires), None) => Some(expires),
            (None, Some(cache_expires)) => Some(cache_expires),
            (Some(expires), Some(cache_expires)) => Some(expires.min(cache_expires)),
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.effective_expiry().is_some_and(|expiry| expiry <= now)
    }
}

/// Ordered map key over (name, creator, published location, lineage).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicationKey {
    pub name: String,
    pub creator: Location,
    pub published_to: Location,
    pub lineage: u64,
}
