// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resolves publish-to relationships into the set of granted peers.
//!
//! A publication names relationship documents (cached contact lists) together
//! with a permission mode per name. Resolution walks the entries in name
//! order and grants or revokes peers against the running result, so later
//! entries override earlier ones.

use std::collections::{BTreeMap, BTreeSet};

use openpeer_core::{Document, Location, PeerUri, Permission, PublicationMetaData, Relationships};
use tracing::debug;

/// Resolves a relationships map against the cached relationship documents.
///
/// Entries whose relationship document is not cached are skipped; an absent
/// contact list never grants anything.
pub(crate) fn resolve(
    relationships: &Relationships,
    permission_documents: &BTreeMap<String, Document>,
) -> BTreeSet<PeerUri> {
    let mut granted = BTreeSet::new();

    for (name, entry) in relationships {
        let Some(document) = permission_documents.get(name) else {
            debug!(relationship = %name, "relationship document not cached, skipping entry");
            continue;
        };
        let listed: BTreeSet<PeerUri> = document.contact_list().into_iter().collect();

        match entry.permission {
            Permission::All => {
                granted.extend(listed);
            }
            Permission::None => {
                for uri in &listed {
                    granted.remove(uri);
                }
            }
            Permission::Add | Permission::Some => {
                for uri in &entry.contacts {
                    if listed.contains(uri) {
                        granted.insert(uri.clone());
                    }
                }
            }
            Permission::Remove => {
                for uri in &entry.contacts {
                    if listed.contains(uri) {
                        granted.remove(uri);
                    }
                }
            }
        }
    }

    granted
}

/// Whether `fetcher` may read the publication described by `meta`.
///
/// The local process always may, finder locations never may and peers must
/// either be the creator or come out of relationship resolution.
pub(crate) fn can_fetch(
    fetcher: &Location,
    meta: &PublicationMetaData,
    permission_documents: &BTreeMap<String, Document>,
) -> bool {
    match fetcher {
        Location::Local => true,
        Location::Finder => false,
        Location::Peer { uri, .. } => {
            meta.creator.peer_uri() == Some(uri)
                || resolve(&meta.relationships, permission_documents).contains(uri)
        }
    }
}

/// Whether `subscriber` gets notified about the publication described by
/// `meta` under a subscription rooted at `path`.
pub(crate) fn can_subscribe(
    subscriber: &Location,
    meta: &PublicationMetaData,
    path: &str,
    permission_documents: &BTreeMap<String, Document>,
) -> bool {
    meta.name.starts_with(path) && can_fetch(subscriber, meta, permission_documents)
}

#[cfg(test)]
mod tests {
    use openpeer_core::RelationshipEntry;

    use super::*;

    fn contacts(uris: &[&str]) -> Document {
        Document::from_contact_list(&uris.iter().map(|uri| PeerUri::from(*uri)).collect::<Vec<_>>())
    }

    fn documents() -> BTreeMap<String, Document> {
        BTreeMap::from([
            ("a-friends".to_string(), contacts(&["peer://ana", "peer://bo", "peer://cy"])),
            ("b-blocked".to_string(), contacts(&["peer://bo"])),
        ])
    }

    #[test]
    fn grant_all_then_revoke_listed() {
        // Name order runs the grant first, the revoke second.
        let relationships = Relationships::from([
            (
                "a-friends".to_string(),
                RelationshipEntry::new(Permission::All, []),
            ),
            (
                "b-blocked".to_string(),
                RelationshipEntry::new(Permission::None, []),
            ),
        ]);

        let granted = resolve(&relationships, &documents());
        assert_eq!(
            granted,
            BTreeSet::from([PeerUri::from("peer://ana"), PeerUri::from("peer://cy")])
        );
    }

    #[test]
    fn add_is_restricted_to_listed_contacts() {
        let relationships = Relationships::from([(
            "a-friends".to_string(),
            RelationshipEntry::new(
                Permission::Add,
                [PeerUri::from("peer://ana"), PeerUri::from("peer://stranger")],
            ),
        )]);

        let granted = resolve(&relationships, &documents());
        assert_eq!(granted, BTreeSet::from([PeerUri::from("peer://ana")]));
    }

    #[test]
    fn remove_only_touches_listed_and_granted() {
        let relationships = Relationships::from([
            (
                "a-friends".to_string(),
                RelationshipEntry::new(Permission::All, []),
            ),
            (
                "b-blocked".to_string(),
                RelationshipEntry::new(
                    Permission::Remove,
                    // `cy` is not in the blocked list, so it survives.
                    [PeerUri::from("peer://bo"), PeerUri::from("peer://cy")],
                ),
            ),
        ]);

        let granted = resolve(&relationships, &documents());
        assert_eq!(
            granted,
            BTreeSet::from([PeerUri::from("peer://ana"), PeerUri::from("peer://cy")])
        );
    }

    #[test]
    fn missing_relationship_document_grants_nothing() {
        let relationships = Relationships::from([(
            "unknown".to_string(),
            RelationshipEntry::new(Permission::All, []),
        )]);

        assert!(resolve(&relationships, &documents()).is_empty());
    }

    #[test]
    fn fetch_permissions_by_location_kind() {
        let mut meta = PublicationMetaData::query(
            "docs/status",
            Location::peer("peer://creator", "1"),
            Location::Local,
        );
        meta.relationships = Relationships::from([(
            "a-friends".to_string(),
            RelationshipEntry::new(Permission::All, []),
        )]);
        let documents = documents();

        assert!(can_fetch(&Location::Local, &meta, &documents));
        assert!(!can_fetch(&Location::Finder, &meta, &documents));
        assert!(can_fetch(
            &Location::peer("peer://ana", "9"),
            &meta,
            &documents
        ));
        assert!(!can_fetch(
            &Location::peer("peer://stranger", "1"),
            &meta,
            &documents
        ));
        // Creators always reach their own publications.
        assert!(can_fetch(
            &Location::peer("peer://creator", "2"),
            &meta,
            &documents
        ));
    }

    #[test]
    fn subscribe_requires_path_prefix() {
        let meta =
            PublicationMetaData::query("docs/status", Location::Local, Location::Local);
        let documents = BTreeMap::new();

        assert!(can_subscribe(&Location::Local, &meta, "docs/", &documents));
        assert!(!can_subscribe(&Location::Local, &meta, "mail/", &documents));
    }
}
