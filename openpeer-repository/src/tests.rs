// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use openpeer_core::diff::{self, DiffItem};
use openpeer_core::{
    ConnectionState, Document, LineageAllocator, Location, Permission, Publication,
    PublicationMetaData, RelationshipEntry, Relationships,
};
use openpeer_store::MemoryCacheStore;
use serde_json::{Value, json};

use crate::message::{
    ERROR_BAD_REQUEST, ERROR_CONFLICT, ERROR_NOT_FOUND, PeerRequest, PeerResult,
    PublicationHeader, WirePayload,
};
use crate::operations::{CancelReason, Completion};
use crate::repository::Repository;
use crate::subscriptions::{SubscriptionEvent, SubscriptionState};
use crate::test_utils::{ScriptTransport, TestNetwork, init_tracing, peer, test_config};
use crate::traits::{MessageTransport, TransportError};

fn doc(value: Value) -> Document {
    Document::from_value(value).unwrap()
}

fn publish_doc(
    lineage: &LineageAllocator,
    name: &str,
    published_to: Location,
    value: Value,
) -> Publication {
    Publication::from_document(
        lineage,
        Location::Local,
        name,
        "text/json",
        doc(value),
        Relationships::new(),
        published_to,
    )
}

/// Transport that never answers; keeps operations pending. Records what it
/// was handed.
#[derive(Clone, Default)]
struct SilentTransport {
    sent: Arc<Mutex<Vec<(Location, PeerRequest)>>>,
}

impl SilentTransport {
    fn sent(&self) -> Vec<(Location, PeerRequest)> {
        self.sent.lock().unwrap().clone()
    }

    async fn wait_for_sent(&self, count: usize) {
        for _ in 0..100 {
            if self.sent().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("transport never saw {count} requests");
    }
}

impl MessageTransport for SilentTransport {
    fn request(
        &self,
        to: Location,
        request: PeerRequest,
    ) -> impl Future<Output = Result<PeerResult, TransportError>> + Send {
        self.sent.lock().unwrap().push((to, request));
        std::future::pending()
    }

    fn notify(
        &self,
        to: Location,
        request: PeerRequest,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        self.sent.lock().unwrap().push((to, request));
        std::future::pending()
    }
}

#[tokio::test]
async fn publish_local_and_fetch() {
    let network = TestNetwork::new();
    let alpha = network.spawn_peer(peer("peer://alpha"), test_config());
    let lineage = LineageAllocator::from_seed(1);

    let publication = publish_doc(
        &lineage,
        "notes/today",
        Location::Local,
        json!({ "body": "hello" }),
    );
    let publisher = alpha.publish(publication).await.unwrap();
    assert!(publisher.result().await.is_completed());

    let query = PublicationMetaData::query("notes/today", Location::Local, Location::Local);
    let fetcher = alpha.fetch(query).await.unwrap();
    let mut fetched = fetcher.result().await.completed().unwrap();
    assert_eq!(fetched.version(), 1);
    assert_eq!(fetched.document().unwrap().get("body"), Some(&json!("hello")));

    let local = alpha.local_publications().await.unwrap();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].name, "notes/today");
}

#[tokio::test]
async fn fetch_of_unknown_local_publication_cancels() {
    let network = TestNetwork::new();
    let alpha = network.spawn_peer(peer("peer://alpha"), test_config());

    let query = PublicationMetaData::query("notes/missing", Location::Local, Location::Local);
    let fetcher = alpha.fetch(query).await.unwrap();
    assert_matches!(
        fetcher.result().await,
        Completion::Cancelled(CancelReason::NotFound)
    );
}

#[tokio::test]
async fn publish_to_peer_lands_in_its_local_cache() {
    init_tracing();
    let network = TestNetwork::new();
    let alpha = network.spawn_peer(peer("peer://alpha"), test_config());
    let bravo = network.spawn_peer(peer("peer://bravo"), test_config());
    let lineage = LineageAllocator::from_seed(1);

    let publication = publish_doc(
        &lineage,
        "notes/today",
        peer("peer://bravo"),
        json!({ "body": "hello" }),
    );
    let publisher = alpha.publish(publication).await.unwrap();
    let published = publisher.result().await.completed().unwrap();
    // The acknowledged version becomes the base for the next publish.
    assert_eq!(published.base_version(), 1);

    let local = bravo.local_publications().await.unwrap();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].name, "notes/today");
    assert_eq!(local[0].version, 1);
    assert_eq!(local[0].creator, peer("peer://alpha"));
    assert!(local[0].published_to.is_local());

    // The creator can always fetch its own publication back. In alpha's own
    // frame of reference it is the local creator.
    let query =
        PublicationMetaData::query("notes/today", Location::Local, peer("peer://bravo"));
    let fetcher = alpha.fetch(query).await.unwrap();
    let mut fetched = fetcher.result().await.completed().unwrap();
    assert_eq!(fetched.document().unwrap().get("body"), Some(&json!("hello")));
}

#[tokio::test]
async fn local_subscriber_observes_peer_publish_and_disconnect() {
    let network = TestNetwork::new();
    let alpha = network.spawn_peer(peer("peer://alpha"), test_config());
    let bravo = network.spawn_peer(peer("peer://bravo"), test_config());
    let lineage = LineageAllocator::from_seed(1);

    let mut subscription = bravo
        .subscribe(Location::Local, "notes", Relationships::new())
        .await
        .unwrap();
    assert_matches!(
        subscription.recv().await,
        Some(SubscriptionEvent::State(SubscriptionState::Established))
    );

    let publication = publish_doc(
        &lineage,
        "notes/today",
        peer("peer://bravo"),
        json!({ "body": "hello" }),
    );
    let publisher = alpha.publish(publication).await.unwrap();
    assert!(publisher.result().await.is_completed());

    assert_matches!(
        subscription.recv().await,
        Some(SubscriptionEvent::Updated(meta)) => {
            assert_eq!(meta.name, "notes/today");
            assert_eq!(meta.creator, peer("peer://alpha"));
        }
    );

    // A subscriber arriving late gets the cached publication replayed.
    let mut late = bravo
        .subscribe(Location::Local, "notes", Relationships::new())
        .await
        .unwrap();
    assert_matches!(
        late.recv().await,
        Some(SubscriptionEvent::State(SubscriptionState::Established))
    );
    assert_matches!(
        late.recv().await,
        Some(SubscriptionEvent::Updated(meta)) => {
            assert_eq!(meta.name, "notes/today");
        }
    );

    // Losing the peer purges what it published here.
    bravo
        .connection_changed(peer("peer://alpha"), ConnectionState::Disconnected)
        .await
        .unwrap();
    assert_matches!(
        subscription.recv().await,
        Some(SubscriptionEvent::Gone(meta)) => {
            assert_eq!(meta.name, "notes/today");
        }
    );
    assert!(bravo.local_publications().await.unwrap().is_empty());
}

#[tokio::test]
async fn fetch_completes_from_cache_without_network() {
    let transport = ScriptTransport::new();
    let store = MemoryCacheStore::default();
    let alpha = Repository::spawn(
        peer("peer://alpha"),
        test_config(),
        transport.clone(),
        store,
    );

    let mut meta =
        PublicationMetaData::query("notes/today", peer("peer://bravo"), peer("peer://bravo"));
    meta.version = 1;
    meta.lineage = 7;
    let mut header = PublicationHeader::from_meta(&meta);
    header.base_version = 0;
    transport.answer(Ok(PeerResult::Get {
        header,
        payload: WirePayload::Document(doc(json!({ "body": "hello" }))),
    }));

    let query =
        PublicationMetaData::query("notes/today", peer("peer://bravo"), peer("peer://bravo"));
    let fetcher = alpha.fetch(query.clone()).await.unwrap();
    assert!(fetcher.result().await.is_completed());

    // The script is empty now; a second network request would cancel with a
    // timeout. The cached copy satisfies the fetch instead.
    let fetcher = alpha.fetch(query).await.unwrap();
    let mut fetched = fetcher.result().await.completed().unwrap();
    assert_eq!(fetched.version(), 1);
    assert_eq!(fetched.document().unwrap().get("body"), Some(&json!("hello")));
    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test]
async fn publish_update_sends_only_diffs() {
    let transport = ScriptTransport::new();
    let alpha = Repository::spawn(
        peer("peer://alpha"),
        test_config(),
        transport.clone(),
        MemoryCacheStore::default(),
    );
    let lineage = LineageAllocator::from_seed(1);

    let publication = publish_doc(
        &lineage,
        "notes/today",
        peer("peer://bravo"),
        json!({ "body": "hello" }),
    );
    let mut ack = PublicationHeader::from_meta(publication.meta());
    transport.answer(Ok(PeerResult::Publish { header: ack.clone() }));

    let publisher = alpha.publish(publication).await.unwrap();
    let mut published = publisher.result().await.completed().unwrap();
    assert_eq!(published.base_version(), 1);

    published
        .update_document(diff::diff_document([DiffItem::set(
            "status",
            json!("ready"),
        )]))
        .unwrap();
    assert_eq!(published.version(), 2);

    ack.version = 2;
    transport.answer(Ok(PeerResult::Publish { header: ack }));
    let publisher = alpha.publish(published).await.unwrap();
    let published = publisher.result().await.completed().unwrap();
    assert_eq!(published.base_version(), 2);

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert_matches!(&sent[0].1, PeerRequest::Publish { header, payload } => {
        assert_eq!(header.base_version, 0);
        assert_matches!(payload, WirePayload::Document(document) if !diff::is_diff_document(document));
    });
    assert_matches!(&sent[1].1, PeerRequest::Publish { header, payload } => {
        assert_eq!(header.base_version, 2);
        assert_matches!(payload, WirePayload::Document(document) if diff::is_diff_document(document));
    });
}

#[tokio::test]
async fn diff_publish_merges_at_peer() {
    let network = TestNetwork::new();
    let alpha = network.spawn_peer(peer("peer://alpha"), test_config());
    let bravo = network.spawn_peer(peer("peer://bravo"), test_config());
    let lineage = LineageAllocator::from_seed(1);

    let publication = publish_doc(
        &lineage,
        "notes/today",
        peer("peer://bravo"),
        json!({ "body": "hello" }),
    );
    let publisher = alpha.publish(publication).await.unwrap();
    let mut published = publisher.result().await.completed().unwrap();

    published
        .update_document(diff::diff_document([DiffItem::set(
            "status",
            json!("ready"),
        )]))
        .unwrap();
    let publisher = alpha.publish(published).await.unwrap();
    assert!(publisher.result().await.is_completed());

    let local = bravo.local_publications().await.unwrap();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].version, 2);

    // The merged document holds both the original and the updated field.
    let query =
        PublicationMetaData::query("notes/today", Location::Local, peer("peer://bravo"));
    let fetcher = alpha.fetch(query).await.unwrap();
    let mut fetched = fetcher.result().await.completed().unwrap();
    let document = fetched.document().unwrap();
    assert_eq!(document.get("body"), Some(&json!("hello")));
    assert_eq!(document.get("status"), Some(&json!("ready")));
}

#[tokio::test]
async fn queued_fetch_completes_with_inflight_result() {
    let transport = ScriptTransport::new();
    let alpha = Repository::spawn(
        peer("peer://alpha"),
        test_config(),
        transport.clone(),
        MemoryCacheStore::default(),
    );

    let mut meta =
        PublicationMetaData::query("notes/today", peer("peer://bravo"), peer("peer://bravo"));
    meta.version = 1;
    meta.lineage = 7;
    let mut header = PublicationHeader::from_meta(&meta);
    header.base_version = 0;
    transport.answer(Ok(PeerResult::Get {
        header,
        payload: WirePayload::Document(doc(json!({ "body": "hello" }))),
    }));

    let query =
        PublicationMetaData::query("notes/today", peer("peer://bravo"), peer("peer://bravo"));
    let first = alpha.fetch(query.clone()).await.unwrap();
    let second = alpha.fetch(query).await.unwrap();

    assert!(first.result().await.is_completed());
    assert!(second.result().await.is_completed());
    // One message satisfied both fetchers.
    assert_eq!(transport.sent().len(), 1);
}

#[tokio::test]
async fn fetch_refetches_whole_copy_when_diffs_do_not_line_up() {
    init_tracing();
    let transport = ScriptTransport::new();
    let alpha = Repository::spawn(
        peer("peer://alpha"),
        test_config(),
        transport.clone(),
        MemoryCacheStore::default(),
    );

    let mut meta =
        PublicationMetaData::query("notes/today", peer("peer://bravo"), peer("peer://bravo"));
    meta.version = 1;
    meta.lineage = 7;
    let mut header = PublicationHeader::from_meta(&meta);
    header.base_version = 0;
    transport.answer(Ok(PeerResult::Get {
        header,
        payload: WirePayload::Document(doc(json!({ "body": "hello" }))),
    }));

    let query =
        PublicationMetaData::query("notes/today", peer("peer://bravo"), peer("peer://bravo"));
    let fetcher = alpha.fetch(query.clone()).await.unwrap();
    assert!(fetcher.result().await.is_completed());

    // The remote answers with a diff run starting past what we hold.
    let mut gapped = meta.clone();
    gapped.version = 6;
    gapped.base_version = 5;
    transport.answer(Ok(PeerResult::Get {
        header: PublicationHeader::from_meta(&gapped),
        payload: WirePayload::Document(diff::diff_document([DiffItem::set(
            "status",
            json!("late"),
        )])),
    }));

    let mut whole = meta.clone();
    whole.version = 6;
    whole.base_version = 0;
    transport.answer(Ok(PeerResult::Get {
        header: PublicationHeader::from_meta(&whole),
        payload: WirePayload::Document(doc(json!({ "body": "hello", "status": "late" }))),
    }));

    let mut wanted = query.clone();
    wanted.version = 6;
    let fetcher = alpha.fetch(wanted).await.unwrap();
    let fetched = fetcher.result().await.completed().unwrap();
    assert_eq!(fetched.version(), 6);

    let sent = transport.sent();
    assert_eq!(sent.len(), 3);
    // The second request was seeded with the version we held.
    assert_matches!(&sent[1].1, PeerRequest::Get { header } => {
        assert_eq!(header.version, 1);
        assert_eq!(header.lineage, 7);
    });
    // The automatic re-fetch asks for the whole copy.
    assert_matches!(&sent[2].1, PeerRequest::Get { header } => {
        assert_eq!(header.version, 0);
    });
}

#[tokio::test]
async fn unauthorized_get_is_silently_ignored() {
    let network = TestNetwork::new();
    let alpha = network.spawn_peer(peer("peer://alpha"), test_config());
    let bravo = network.spawn_peer(peer("peer://bravo"), test_config());
    let lineage = LineageAllocator::from_seed(1);

    // No contact list named "team" exists yet, so nobody resolves.
    let mut relationships = Relationships::new();
    relationships.insert(
        "team".to_string(),
        RelationshipEntry::new(Permission::All, []),
    );
    let publication = Publication::from_document(
        &lineage,
        Location::Local,
        "notes/plan",
        "text/json",
        doc(json!({ "body": "secret" })),
        relationships,
        Location::Local,
    );
    let publisher = bravo.publish(publication).await.unwrap();
    assert!(publisher.result().await.is_completed());

    let query =
        PublicationMetaData::query("notes/plan", peer("peer://bravo"), peer("peer://bravo"));
    let fetcher = alpha.fetch(query.clone()).await.unwrap();
    assert_matches!(
        fetcher.result().await,
        Completion::Cancelled(CancelReason::Transport(TransportError::Timeout))
    );

    // Publishing the contact list opens the publication up.
    let contacts = [peer("peer://alpha")];
    let contact_uris: Vec<_> = contacts.iter().filter_map(|c| c.peer_uri()).collect();
    let contact_list = Publication::from_contact_list(
        &lineage,
        Location::Local,
        "team",
        contact_uris.into_iter(),
        Relationships::new(),
        Location::Local,
    );
    let publisher = bravo.publish(contact_list).await.unwrap();
    assert!(publisher.result().await.is_completed());

    let fetcher = alpha.fetch(query).await.unwrap();
    let mut fetched = fetcher.result().await.completed().unwrap();
    assert_eq!(fetched.document().unwrap().get("body"), Some(&json!("secret")));
}

#[tokio::test]
async fn peer_published_contact_list_updates_permissions() {
    let network = TestNetwork::new();
    let alpha = network.spawn_peer(peer("peer://alpha"), test_config());
    let bravo = network.spawn_peer(peer("peer://bravo"), test_config());
    let lineage = LineageAllocator::from_seed(1);

    let mut relationships = Relationships::new();
    relationships.insert(
        "team".to_string(),
        RelationshipEntry::new(Permission::All, []),
    );
    let publication = Publication::from_document(
        &lineage,
        Location::Local,
        "notes/plan",
        "text/json",
        doc(json!({ "body": "secret" })),
        relationships,
        Location::Local,
    );
    let publisher = bravo.publish(publication).await.unwrap();
    assert!(publisher.result().await.is_completed());

    let query =
        PublicationMetaData::query("notes/plan", peer("peer://bravo"), peer("peer://bravo"));
    let fetcher = alpha.fetch(query.clone()).await.unwrap();
    assert_matches!(
        fetcher.result().await,
        Completion::Cancelled(CancelReason::Transport(TransportError::Timeout))
    );

    // A contact list pushed by a peer refreshes the permission cache at the
    // receiver just like a locally published one.
    let contacts = [peer("peer://alpha")];
    let contact_uris: Vec<_> = contacts.iter().filter_map(|c| c.peer_uri()).collect();
    let contact_list = Publication::from_contact_list(
        &lineage,
        Location::Local,
        "team",
        contact_uris.into_iter(),
        Relationships::new(),
        peer("peer://bravo"),
    );
    let publisher = alpha.publish(contact_list).await.unwrap();
    assert!(publisher.result().await.is_completed());

    let fetcher = alpha.fetch(query).await.unwrap();
    let mut fetched = fetcher.result().await.completed().unwrap();
    assert_eq!(fetched.document().unwrap().get("body"), Some(&json!("secret")));
}

#[tokio::test]
async fn remote_remove_deletes_at_peer() {
    let network = TestNetwork::new();
    let alpha = network.spawn_peer(peer("peer://alpha"), test_config());
    let bravo = network.spawn_peer(peer("peer://bravo"), test_config());
    let lineage = LineageAllocator::from_seed(1);

    let publication = publish_doc(
        &lineage,
        "notes/today",
        peer("peer://bravo"),
        json!({ "body": "hello" }),
    );
    let publisher = alpha.publish(publication).await.unwrap();
    assert!(publisher.result().await.is_completed());
    assert_eq!(bravo.local_publications().await.unwrap().len(), 1);

    let target =
        PublicationMetaData::query("notes/today", Location::Local, peer("peer://bravo"));
    let remover = alpha.remove(target.clone()).await.unwrap();
    assert_matches!(remover.result().await, Completion::Completed(()));
    assert!(bravo.local_publications().await.unwrap().is_empty());

    // Removing it again reports not found.
    let remover = alpha.remove(target).await.unwrap();
    assert_matches!(
        remover.result().await,
        Completion::Cancelled(CancelReason::NotFound)
    );
}

#[tokio::test]
async fn local_remove_always_completes() {
    let network = TestNetwork::new();
    let alpha = network.spawn_peer(peer("peer://alpha"), test_config());
    let lineage = LineageAllocator::from_seed(1);

    let publication = publish_doc(
        &lineage,
        "notes/today",
        Location::Local,
        json!({ "body": "hello" }),
    );
    assert!(
        alpha
            .publish(publication)
            .await
            .unwrap()
            .result()
            .await
            .is_completed()
    );

    let target = PublicationMetaData::query("notes/today", Location::Local, Location::Local);
    let remover = alpha.remove(target.clone()).await.unwrap();
    assert_matches!(remover.result().await, Completion::Completed(()));
    assert!(alpha.local_publications().await.unwrap().is_empty());

    // Removal is idempotent; a second remove observes nothing and still
    // completes.
    let remover = alpha.remove(target).await.unwrap();
    assert_matches!(remover.result().await, Completion::Completed(()));
}

#[tokio::test]
async fn incoming_publish_validates_diff_runs() {
    let bravo = Repository::spawn(
        peer("peer://bravo"),
        test_config(),
        ScriptTransport::new(),
        MemoryCacheStore::default(),
    );

    let mut meta =
        PublicationMetaData::query("notes/today", peer("peer://alpha"), Location::Local);
    meta.version = 2;
    meta.lineage = 9;
    meta.base_version = 2;

    // Diffs against nothing are rejected.
    let result = bravo
        .handle_request(
            peer("peer://alpha"),
            PeerRequest::Publish {
                header: PublicationHeader::from_meta(&meta),
                payload: WirePayload::Document(diff::diff_document([DiffItem::set(
                    "status",
                    json!("ready"),
                )])),
            },
        )
        .await
        .unwrap();
    assert_matches!(result, Some(PeerResult::Error { code, .. }) if code == ERROR_NOT_FOUND);

    // A whole copy is accepted and echoed back.
    let mut full = meta.clone();
    full.version = 1;
    full.base_version = 0;
    let result = bravo
        .handle_request(
            peer("peer://alpha"),
            PeerRequest::Publish {
                header: PublicationHeader::from_meta(&full),
                payload: WirePayload::Document(doc(json!({ "body": "hello" }))),
            },
        )
        .await
        .unwrap();
    assert_matches!(result, Some(PeerResult::Publish { header }) => {
        assert_eq!(header.version, 1);
    });

    // A diff run starting past the cached version conflicts.
    let mut gapped = meta.clone();
    gapped.version = 8;
    gapped.base_version = 7;
    let result = bravo
        .handle_request(
            peer("peer://alpha"),
            PeerRequest::Publish {
                header: PublicationHeader::from_meta(&gapped),
                payload: WirePayload::Document(diff::diff_document([DiffItem::set(
                    "status",
                    json!("late"),
                )])),
            },
        )
        .await
        .unwrap();
    assert_matches!(result, Some(PeerResult::Error { code, .. }) if code == ERROR_CONFLICT);

    // The mismatching run left the cached copy untouched.
    let local = bravo.local_publications().await.unwrap();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].version, 1);

    // A payload that does not decode is a bad request.
    let result = bravo
        .handle_request(
            peer("peer://alpha"),
            PeerRequest::Publish {
                header: PublicationHeader::from_meta(&full),
                payload: WirePayload::Binary("not base64!".to_string()),
            },
        )
        .await
        .unwrap();
    assert_matches!(result, Some(PeerResult::Error { code, .. }) if code == ERROR_BAD_REQUEST);
}

#[tokio::test]
async fn incoming_publish_lands_under_the_sending_peer() {
    let bravo = Repository::spawn(
        peer("peer://bravo"),
        test_config(),
        ScriptTransport::new(),
        MemoryCacheStore::default(),
    );

    // The header claims somebody else created this and published it
    // elsewhere; the transport says alpha sent it to us.
    let mut meta =
        PublicationMetaData::query("notes/today", peer("peer://mallory"), peer("peer://mallory"));
    meta.version = 1;
    meta.lineage = 9;
    let result = bravo
        .handle_request(
            peer("peer://alpha"),
            PeerRequest::Publish {
                header: PublicationHeader::from_meta(&meta),
                payload: WirePayload::Document(doc(json!({ "body": "hello" }))),
            },
        )
        .await
        .unwrap();
    assert_matches!(result, Some(PeerResult::Publish { .. }));

    let local = bravo.local_publications().await.unwrap();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].creator, peer("peer://alpha"));
    assert!(local[0].published_to.is_local());
}

#[tokio::test]
async fn remote_subscription_replays_existing_publications() {
    let network = TestNetwork::new();
    let alpha = network.spawn_peer(peer("peer://alpha"), test_config());
    let bravo = network.spawn_peer(peer("peer://bravo"), test_config());
    let lineage = LineageAllocator::from_seed(1);

    // Bravo publishes before anyone subscribes; the publication is open to
    // alpha through a contact list.
    let contacts = [peer("peer://alpha")];
    let contact_uris: Vec<_> = contacts.iter().filter_map(|c| c.peer_uri()).collect();
    let contact_list = Publication::from_contact_list(
        &lineage,
        Location::Local,
        "team",
        contact_uris.into_iter(),
        Relationships::new(),
        Location::Local,
    );
    assert!(
        bravo
            .publish(contact_list)
            .await
            .unwrap()
            .result()
            .await
            .is_completed()
    );

    let mut relationships = Relationships::new();
    relationships.insert(
        "team".to_string(),
        RelationshipEntry::new(Permission::All, []),
    );
    let publication = Publication::from_document(
        &lineage,
        Location::Local,
        "notes/today",
        "text/json",
        doc(json!({ "body": "hello" })),
        relationships.clone(),
        Location::Local,
    );
    assert!(
        bravo
            .publish(publication)
            .await
            .unwrap()
            .result()
            .await
            .is_completed()
    );

    let mut subscription = alpha
        .subscribe(peer("peer://bravo"), "notes", Relationships::new())
        .await
        .unwrap();

    // State events and the replayed notification race; wait for the update.
    let mut updated = None;
    for _ in 0..4 {
        match subscription.recv().await {
            Some(SubscriptionEvent::Updated(meta)) => {
                updated = Some(meta);
                break;
            }
            Some(_) => continue,
            None => break,
        }
    }
    let updated = updated.expect("no update event");
    assert_eq!(updated.name, "notes/today");
    assert_eq!(updated.published_to, peer("peer://bravo"));
}

#[tokio::test]
async fn notify_with_payload_updates_remote_cache() {
    init_tracing();
    let transport = ScriptTransport::new();
    transport.answer(Ok(PeerResult::Subscribe {
        path: "notes".to_string(),
    }));
    let alpha = Repository::spawn(
        peer("peer://alpha"),
        test_config(),
        transport.clone(),
        MemoryCacheStore::default(),
    );

    let mut subscription = alpha
        .subscribe(peer("peer://bravo"), "notes", Relationships::new())
        .await
        .unwrap();
    assert_matches!(
        subscription.recv().await,
        Some(SubscriptionEvent::State(SubscriptionState::Pending))
    );
    assert_matches!(
        subscription.recv().await,
        Some(SubscriptionEvent::State(SubscriptionState::Established))
    );

    // The peer pushes a whole copy along with its notification.
    let mut meta =
        PublicationMetaData::query("notes/today", peer("peer://bravo"), peer("peer://bravo"));
    meta.version = 1;
    meta.lineage = 4;
    let reply = alpha
        .handle_request(
            peer("peer://bravo"),
            PeerRequest::PublishNotify {
                header: PublicationHeader::from_meta(&meta),
                payload: Some(WirePayload::Document(doc(json!({ "body": "hello" })))),
            },
        )
        .await
        .unwrap();
    assert!(reply.is_none());
    assert_matches!(
        subscription.recv().await,
        Some(SubscriptionEvent::Updated(updated)) if updated.version == 1
    );

    // A follow-up diff run merges into the pushed copy.
    let mut update = meta.clone();
    update.version = 2;
    update.base_version = 2;
    alpha
        .handle_request(
            peer("peer://bravo"),
            PeerRequest::PublishNotify {
                header: PublicationHeader::from_meta(&update),
                payload: Some(WirePayload::Document(diff::diff_document([DiffItem::set(
                    "status",
                    json!("ready"),
                )]))),
            },
        )
        .await
        .unwrap();
    assert_matches!(
        subscription.recv().await,
        Some(SubscriptionEvent::Updated(updated)) if updated.version == 2
    );

    // The pushed copy satisfies a fetch without another wire request.
    let query =
        PublicationMetaData::query("notes/today", peer("peer://bravo"), peer("peer://bravo"));
    let fetcher = alpha.fetch(query).await.unwrap();
    let mut fetched = fetcher.result().await.completed().unwrap();
    assert_eq!(fetched.version(), 2);
    assert_eq!(
        fetched.document().unwrap().get("status"),
        Some(&json!("ready"))
    );
    assert_eq!(transport.sent().len(), 1);

    // A run that does not line up is dropped; the notification still fires.
    let mut gapped = meta.clone();
    gapped.version = 9;
    gapped.base_version = 9;
    alpha
        .handle_request(
            peer("peer://bravo"),
            PeerRequest::PublishNotify {
                header: PublicationHeader::from_meta(&gapped),
                payload: Some(WirePayload::Document(diff::diff_document([DiffItem::set(
                    "status",
                    json!("late"),
                )]))),
            },
        )
        .await
        .unwrap();
    assert_matches!(
        subscription.recv().await,
        Some(SubscriptionEvent::Updated(updated)) if updated.version == 9
    );
    let remote = alpha.remote_publications().await.unwrap();
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].version, 2);
}

#[tokio::test]
async fn disconnect_expires_fetched_copies_after_grace() {
    let network = TestNetwork::new();
    let mut config = test_config();
    config.disconnect_grace = Duration::ZERO;
    let alpha = network.spawn_peer(peer("peer://alpha"), config);
    let bravo = network.spawn_peer(peer("peer://bravo"), test_config());
    let lineage = LineageAllocator::from_seed(1);

    let publication = publish_doc(
        &lineage,
        "notes/today",
        peer("peer://bravo"),
        json!({ "body": "hello" }),
    );
    assert!(
        alpha
            .publish(publication)
            .await
            .unwrap()
            .result()
            .await
            .is_completed()
    );

    let query =
        PublicationMetaData::query("notes/today", Location::Local, peer("peer://bravo"));
    let fetcher = alpha.fetch(query).await.unwrap();
    assert!(fetcher.result().await.is_completed());
    assert_eq!(alpha.remote_publications().await.unwrap().len(), 1);

    // A sweep without a disconnect keeps the copy.
    alpha.sweep().await.unwrap();
    assert_eq!(alpha.remote_publications().await.unwrap().len(), 1);

    // With a zero grace window the copy expires on the next sweep.
    alpha
        .connection_changed(peer("peer://bravo"), ConnectionState::Disconnected)
        .await
        .unwrap();
    alpha.sweep().await.unwrap();
    assert!(alpha.remote_publications().await.unwrap().is_empty());
}

#[tokio::test]
async fn reconnect_within_grace_keeps_fetched_copies() {
    let network = TestNetwork::new();
    let mut config = test_config();
    config.disconnect_grace = Duration::from_secs(3600);
    let alpha = network.spawn_peer(peer("peer://alpha"), config);
    let bravo = network.spawn_peer(peer("peer://bravo"), test_config());
    let lineage = LineageAllocator::from_seed(1);

    let publication = publish_doc(
        &lineage,
        "notes/today",
        peer("peer://bravo"),
        json!({ "body": "hello" }),
    );
    assert!(
        alpha
            .publish(publication)
            .await
            .unwrap()
            .result()
            .await
            .is_completed()
    );
    let query =
        PublicationMetaData::query("notes/today", Location::Local, peer("peer://bravo"));
    assert!(alpha.fetch(query).await.unwrap().result().await.is_completed());

    alpha
        .connection_changed(peer("peer://bravo"), ConnectionState::Disconnected)
        .await
        .unwrap();
    alpha
        .connection_changed(peer("peer://bravo"), ConnectionState::Connected)
        .await
        .unwrap();
    alpha.sweep().await.unwrap();

    let remote = alpha.remote_publications().await.unwrap();
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].cache_expires, None);
}

#[tokio::test]
async fn parked_documents_restore_on_fetch() {
    let network = TestNetwork::new();
    let mut config = test_config();
    config.document_idle = Duration::ZERO;
    let alpha = network.spawn_peer(peer("peer://alpha"), config);
    let lineage = LineageAllocator::from_seed(1);

    let publication = publish_doc(
        &lineage,
        "notes/today",
        Location::Local,
        json!({ "body": "hello" }),
    );
    assert!(
        alpha
            .publish(publication)
            .await
            .unwrap()
            .result()
            .await
            .is_completed()
    );

    // Everything idle parks into the cache store.
    alpha.sweep().await.unwrap();

    let query = PublicationMetaData::query("notes/today", Location::Local, Location::Local);
    let fetcher = alpha.fetch(query).await.unwrap();
    let mut fetched = fetcher.result().await.completed().unwrap();
    assert_eq!(fetched.document().unwrap().get("body"), Some(&json!("hello")));
}

#[tokio::test]
async fn binary_publication_round_trip() {
    let network = TestNetwork::new();
    let alpha = network.spawn_peer(peer("peer://alpha"), test_config());
    let bravo = network.spawn_peer(peer("peer://bravo"), test_config());
    let lineage = LineageAllocator::from_seed(1);

    let publication = Publication::from_bytes(
        &lineage,
        Location::Local,
        "blobs/avatar",
        "image/png",
        vec![0x89, 0x50, 0x4e, 0x47],
        Relationships::new(),
        peer("peer://bravo"),
    );
    assert!(
        alpha
            .publish(publication)
            .await
            .unwrap()
            .result()
            .await
            .is_completed()
    );

    let query =
        PublicationMetaData::query("blobs/avatar", Location::Local, peer("peer://bravo"));
    let fetcher = alpha.fetch(query).await.unwrap();
    let fetched = fetcher.result().await.completed().unwrap();
    assert_eq!(fetched.data(), Some(&[0x89, 0x50, 0x4e, 0x47][..]));
    assert_eq!(bravo.local_publications().await.unwrap().len(), 1);
}

#[tokio::test]
async fn cancelled_fetch_reports_caller() {
    let alpha = Repository::spawn(
        peer("peer://alpha"),
        test_config(),
        SilentTransport::default(),
        MemoryCacheStore::default(),
    );

    let query =
        PublicationMetaData::query("notes/today", peer("peer://bravo"), peer("peer://bravo"));
    let fetcher = alpha.fetch(query).await.unwrap();
    fetcher.cancel().await;
    assert_matches!(
        fetcher.result().await,
        Completion::Cancelled(CancelReason::Caller)
    );
}

#[tokio::test]
async fn cancelling_head_fetch_activates_queued_fetch() {
    let transport = SilentTransport::default();
    let alpha = Repository::spawn(
        peer("peer://alpha"),
        test_config(),
        transport.clone(),
        MemoryCacheStore::default(),
    );

    let query =
        PublicationMetaData::query("notes/today", peer("peer://bravo"), peer("peer://bravo"));
    let first = alpha.fetch(query.clone()).await.unwrap();
    let second = alpha.fetch(query).await.unwrap();

    // Only the head of the queue goes on the wire.
    transport.wait_for_sent(1).await;
    assert_eq!(transport.sent().len(), 1);

    first.cancel().await;
    assert_matches!(
        first.result().await,
        Completion::Cancelled(CancelReason::Caller)
    );

    // Cancelling the head hands the wire to the queued fetcher.
    transport.wait_for_sent(2).await;
    assert_matches!(transport.sent()[1].1, PeerRequest::Get { .. });

    second.cancel().await;
    assert_matches!(
        second.result().await,
        Completion::Cancelled(CancelReason::Caller)
    );
}

#[tokio::test]
async fn shutdown_cancels_pending_operations_and_streams() {
    let alpha = Repository::spawn(
        peer("peer://alpha"),
        test_config(),
        SilentTransport::default(),
        MemoryCacheStore::default(),
    );

    let mut subscription = alpha
        .subscribe(Location::Local, "notes", Relationships::new())
        .await
        .unwrap();
    assert_matches!(
        subscription.recv().await,
        Some(SubscriptionEvent::State(SubscriptionState::Established))
    );

    let query =
        PublicationMetaData::query("notes/today", peer("peer://bravo"), peer("peer://bravo"));
    let fetcher = alpha.fetch(query).await.unwrap();

    alpha.shutdown().await.unwrap();

    assert_matches!(
        fetcher.result().await,
        Completion::Cancelled(CancelReason::Shutdown)
    );
    assert_matches!(
        subscription.recv().await,
        Some(SubscriptionEvent::State(SubscriptionState::Shutdown))
    );
    assert_matches!(subscription.recv().await, None);
}
