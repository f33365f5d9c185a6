// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use openpeer_core::{
    ConnectionState, Document, Encoding, Location, Publication, PublicationError, PublicationKey,
    PublicationMetaData, Relationships,
};
use openpeer_store::{CacheStore, current_timestamp};
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, trace, warn};

use crate::config::RepositoryConfig;
use crate::message::{
    ERROR_BAD_REQUEST, ERROR_CONFLICT, ERROR_NOT_FOUND, PeerRequest, PeerResult,
    PublicationHeader, WirePayload,
};
use crate::operations::{CancelReason, Completion, OperationId, PendingQueue};
use crate::relationships;
use crate::subscriptions::{
    IncomingSubscription, OutgoingSubscription, SubscriptionEvent, SubscriptionId,
    SubscriptionState, relationship_names_match,
};
use crate::traits::{MessageTransport, TransportError};

pub(crate) enum ToRepositoryActor {
    Publish {
        id: OperationId,
        publication: Publication,
        result_tx: oneshot::Sender<Completion<Publication>>,
    },
    Fetch {
        id: OperationId,
        meta: PublicationMetaData,
        result_tx: oneshot::Sender<Completion<Publication>>,
    },
    Remove {
        id: OperationId,
        meta: PublicationMetaData,
        result_tx: oneshot::Sender<Completion<()>>,
    },
    Subscribe {
        id: SubscriptionId,
        location: Location,
        path: String,
        relationships: Relationships,
        events_tx: mpsc::Sender<SubscriptionEvent>,
    },
    CancelOperation {
        id: OperationId,
    },
    CancelSubscription {
        id: SubscriptionId,
    },
    RequestResolved {
        id: OperationId,
        result: Result<PeerResult, TransportError>,
    },
    SubscribeResolved {
        id: SubscriptionId,
        result: Result<PeerResult, TransportError>,
    },
    PeerRequest {
        from: Location,
        request: PeerRequest,
        reply: oneshot::Sender<Option<PeerResult>>,
    },
    ConnectionChanged {
        location: Location,
        state: ConnectionState,
    },
    LocalPublications {
        reply: oneshot::Sender<Vec<PublicationMetaData>>,
    },
    RemotePublications {
        reply: oneshot::Sender<Vec<PublicationMetaData>>,
    },
    Sweep {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Routes resolved transport results back to the operation they belong to.
#[derive(Clone, Debug)]
enum OperationKind {
    Publish(PublicationKey),
    Fetch(PublicationKey),
    Remove,
}

struct PendingPublish {
    publication: Publication,
    result_tx: oneshot::Sender<Completion<Publication>>,
}

struct PendingFetch {
    meta: PublicationMetaData,
    /// A fetched diff which did not line up triggers exactly one automatic
    /// whole-copy re-fetch.
    refetched: bool,
    result_tx: oneshot::Sender<Completion<Publication>>,
}

struct PendingRemove {
    result_tx: oneshot::Sender<Completion<()>>,
}

/// What one remote location has fetched from us, plus an expiry once the
/// location disconnected.
#[derive(Debug, Default)]
struct PeerSource {
    fetched: BTreeMap<PublicationKey, u64>,
    expires: Option<u64>,
}

pub(crate) struct RepositoryActor<T, S> {
    identity: Location,
    config: RepositoryConfig,
    transport: Arc<T>,
    store: S,
    inbox: mpsc::Receiver<ToRepositoryActor>,
    actor_tx: mpsc::Sender<ToRepositoryActor>,
    /// Publications published into this repository, ours and our peers'.
    local: BTreeMap<PublicationKey, Publication>,
    /// Copies fetched from remote locations.
    remote: BTreeMap<PublicationKey, Publication>,
    /// Relationship documents by name, fed from local publishes.
    permissions: BTreeMap<String, Document>,
    peer_sources: BTreeMap<Location, PeerSource>,
    pending_publishes: PendingQueue<PendingPublish>,
    pending_fetches: PendingQueue<PendingFetch>,
    pending_removes: HashMap<OperationId, PendingRemove>,
    operation_keys: HashMap<OperationId, OperationKind>,
    outgoing_subs: BTreeMap<SubscriptionId, OutgoingSubscription>,
    incoming_subs: BTreeMap<(Location, String), IncomingSubscription>,
}

impl<T, S> RepositoryActor<T, S>
where
    T: MessageTransport + Send + Sync + 'static,
    S: CacheStore + Send + Sync + 'static,
{
    pub fn new(
        identity: Location,
        config: RepositoryConfig,
        transport: T,
        store: S,
        inbox: mpsc::Receiver<ToRepositoryActor>,
        actor_tx: mpsc::Sender<ToRepositoryActor>,
    ) -> Self {
        Self {
            identity,
            config,
            transport: Arc::new(transport),
            store,
            inbox,
            actor_tx,
            local: BTreeMap::new(),
            remote: BTreeMap::new(),
            permissions: BTreeMap::new(),
            peer_sources: BTreeMap::new(),
            pending_publishes: PendingQueue::new(),
            pending_fetches: PendingQueue::new(),
            pending_removes: HashMap::new(),
            operation_keys: HashMap::new(),
            outgoing_subs: BTreeMap::new(),
            incoming_subs: BTreeMap::new(),
        }
    }

    pub async fn run(mut self) {
        let shutdown_reply = self.run_inner().await;
        self.shutdown();
        if let Some(reply) = shutdown_reply {
            reply.send(()).ok();
        }
    }

    async fn run_inner(&mut self) -> Option<oneshot::Sender<()>> {
        let mut sweep_interval = interval(self.config.sweep_interval);

        loop {
            tokio::select! {
                biased;
                msg = self.inbox.recv() => {
                    match msg {
                        Some(ToRepositoryActor::Shutdown { reply }) => break Some(reply),
                        Some(msg) => self.on_actor_message(msg).await,
                        None => break None,
                    }
                },
                _ = sweep_interval.tick() => {
                    self.on_sweep().await;
                },
            }
        }
    }

    async fn on_actor_message(&mut self, msg: ToRepositoryActor) {
        match msg {
            ToRepositoryActor::Publish {
                id,
                publication,
                result_tx,
            } => {
                self.on_publish(id, publication, result_tx);
            }
            ToRepositoryActor::Fetch {
                id,
                meta,
                result_tx,
            } => {
                self.on_fetch(id, meta, result_tx).await;
            }
            ToRepositoryActor::Remove {
                id,
                meta,
                result_tx,
            } => {
                self.on_remove(id, meta, result_tx);
            }
            ToRepositoryActor::Subscribe {
                id,
                location,
                path,
                relationships,
                events_tx,
            } => {
                self.on_subscribe(id, location, path, relationships, events_tx);
            }
            ToRepositoryActor::CancelOperation { id } => {
                self.on_cancel_operation(id).await;
            }
            ToRepositoryActor::CancelSubscription { id } => {
                if let Some(subscription) = self.outgoing_subs.remove(&id) {
                    subscription.notify(SubscriptionEvent::State(SubscriptionState::Shutdown));
                }
            }
            ToRepositoryActor::RequestResolved { id, result } => {
                self.on_request_resolved(id, result).await;
            }
            ToRepositoryActor::SubscribeResolved { id, result } => {
                self.on_subscribe_resolved(id, result);
            }
            ToRepositoryActor::PeerRequest {
                from,
                request,
                reply,
            } => {
                let result = self.on_peer_request(from, request).await;
                reply.send(result).ok();
            }
            ToRepositoryActor::ConnectionChanged { location, state } => {
                self.on_connection_changed(location, state);
            }
            ToRepositoryActor::LocalPublications { reply } => {
                let list = self.local.values().map(|p| p.meta().clone()).collect();
                reply.send(list).ok();
            }
            ToRepositoryActor::RemotePublications { reply } => {
                let list = self.remote.values().map(|p| p.meta().clone()).collect();
                reply.send(list).ok();
            }
            ToRepositoryActor::Sweep { reply } => {
                self.on_sweep().await;
                reply.send(()).ok();
            }
            ToRepositoryActor::Shutdown { .. } => {
                unreachable!("handled in run_inner");
            }
        }
    }

    // Publishing

    fn on_publish(
        &mut self,
        id: OperationId,
        publication: Publication,
        result_tx: oneshot::Sender<Completion<Publication>>,
    ) {
        if publication.published_to().is_local() {
            self.publish_local(publication, result_tx);
            return;
        }

        let key = publication.key();
        self.operation_keys
            .insert(id, OperationKind::Publish(key.clone()));
        let activate = self.pending_publishes.push(
            key.clone(),
            id,
            PendingPublish {
                publication,
                result_tx,
            },
        );
        if activate {
            self.activate_publish(&key);
        }
    }

    /// Inserts into the local cache, replacing every previous epoch of the
    /// same identity, and completes immediately.
    fn publish_local(
        &mut self,
        mut publication: Publication,
        result_tx: oneshot::Sender<Completion<Publication>>,
    ) {
        for stale in self.find_local_keys_matching(publication.meta(), true) {
            self.local.remove(&stale);
        }

        self.cache_permission_document(&mut publication);
        let meta = publication.meta().clone();
        let snapshot = publication.clone();
        self.local.insert(publication.key(), publication);

        debug!(name = %meta.name, version = meta.version, "published locally");
        result_tx.send(Completion::Completed(snapshot)).ok();
        self.announce_publication(&meta);
    }

    /// Sends the publish message for the head entry of the identity's queue.
    fn activate_publish(&mut self, key: &PublicationKey) {
        let prepared = {
            let Some((id, pending)) = self.pending_publishes.head_mut(key) else {
                return;
            };
            let to = pending.publication.published_to().clone();
            match pending.publication.publish_contents() {
                Ok(contents) => {
                    let mut header =
                        globalized_header(&self.identity, pending.publication.meta());
                    header.base_version = contents.base_version();
                    let payload = WirePayload::from_contents(&contents);
                    Ok((id, to, PeerRequest::Publish { header, payload }))
                }
                Err(err) => Err((id, err)),
            }
        };

        match prepared {
            Ok((id, to, request)) => self.spawn_request(id, to, request),
            Err((id, err)) => {
                warn!(%err, "cannot prepare publish contents");
                let reason = CancelReason::Transport(TransportError::Custom(err.to_string()));
                self.resolve_publish(key, id, Completion::Cancelled(reason));
            }
        }
    }

    fn on_publish_resolved(
        &mut self,
        key: PublicationKey,
        id: OperationId,
        result: Result<PeerResult, TransportError>,
    ) {
        let completion = match result {
            Ok(PeerResult::Publish { header }) => {
                // The remote echoed the version it now holds; remember it so
                // the next publish only carries the diffs on top.
                match self.pending_publishes.head_mut(&key) {
                    Some((head_id, pending)) if head_id == id => {
                        pending.publication.set_base_version(header.version);
                        Completion::Completed(pending.publication.clone())
                    }
                    _ => return,
                }
            }
            Ok(PeerResult::Error { code, reason }) => {
                Completion::Cancelled(if code == ERROR_NOT_FOUND {
                    CancelReason::NotFound
                } else {
                    CancelReason::Protocol { code, reason }
                })
            }
            Ok(_) => Completion::Cancelled(CancelReason::UnexpectedResult),
            Err(err) => Completion::Cancelled(CancelReason::Transport(err)),
        };
        self.resolve_publish(&key, id, completion);
    }

    fn resolve_publish(
        &mut self,
        key: &PublicationKey,
        id: OperationId,
        completion: Completion<Publication>,
    ) {
        self.operation_keys.remove(&id);
        if let Some((pending, was_head)) = self.pending_publishes.remove(key, id) {
            pending.result_tx.send(completion).ok();
            if was_head {
                self.activate_publish(key);
            }
        }
    }

    // Fetching

    async fn on_fetch(
        &mut self,
        id: OperationId,
        meta: PublicationMetaData,
        result_tx: oneshot::Sender<Completion<Publication>>,
    ) {
        if meta.published_to.is_local() {
            let completion = match self.local_snapshot(&meta).await {
                Some(snapshot) => Completion::Completed(snapshot),
                None => Completion::Cancelled(CancelReason::NotFound),
            };
            result_tx.send(completion).ok();
            return;
        }

        let key = meta.key();
        self.operation_keys
            .insert(id, OperationKind::Fetch(key.clone()));
        let activate = self.pending_fetches.push(
            key.clone(),
            id,
            PendingFetch {
                meta,
                refetched: false,
                result_tx,
            },
        );
        if activate {
            self.activate_fetch(&key).await;
        }
    }

    /// Works through the identity's fetch queue: every head already satisfied
    /// by the remote cache completes on the spot, the first one that is not
    /// gets a message sent for it.
    async fn activate_fetch(&mut self, key: &PublicationKey) {
        loop {
            let Some((id, pending)) = self.pending_fetches.head(key) else {
                return;
            };
            let meta = pending.meta.clone();

            if let Some(snapshot) = self.remote_snapshot_satisfying(&meta).await {
                self.operation_keys.remove(&id);
                if let Some((pending, _)) = self.pending_fetches.remove(key, id) {
                    pending.result_tx.send(Completion::Completed(snapshot)).ok();
                }
                continue;
            }

            // Seed the request with what we already hold, from any epoch, so
            // the remote can answer with a diff run.
            let known = self
                .find_remote_key_matching(&meta, true)
                .and_then(|cached_key| self.remote.get(&cached_key))
                .map(|cached| (cached.version(), cached.lineage()));
            let mut header = globalized_header(&self.identity, &meta);
            if let Some((version, lineage)) = known {
                header.version = version;
                header.lineage = lineage;
            }
            self.spawn_request(id, meta.published_to.clone(), PeerRequest::Get { header });
            return;
        }
    }

    async fn on_fetch_resolved(
        &mut self,
        key: PublicationKey,
        id: OperationId,
        result: Result<PeerResult, TransportError>,
    ) {
        match self.pending_fetches.head(&key) {
            Some((head_id, _)) if head_id == id => (),
            _ => return,
        }

        match result {
            Ok(PeerResult::Get { header, payload }) => {
                let meta = localized_meta(&self.identity, header);
                match payload.into_contents(meta.base_version) {
                    Ok(contents) => {
                        let fetched = Publication::from_wire(meta, contents);
                        self.on_fetched_publication(key, id, fetched).await;
                    }
                    Err(err) => {
                        let reason =
                            CancelReason::Transport(TransportError::Custom(err.to_string()));
                        self.complete_fetch(&key, id, Completion::Cancelled(reason))
                            .await;
                    }
                }
            }
            Ok(PeerResult::Error { code, reason }) => {
                let reason = if code == ERROR_NOT_FOUND {
                    CancelReason::NotFound
                } else {
                    CancelReason::Protocol { code, reason }
                };
                self.complete_fetch(&key, id, Completion::Cancelled(reason))
                    .await;
            }
            Ok(_) => {
                self.complete_fetch(&key, id, Completion::Cancelled(CancelReason::UnexpectedResult))
                    .await;
            }
            Err(err) => {
                self.complete_fetch(&key, id, Completion::Cancelled(CancelReason::Transport(err)))
                    .await;
            }
        }
    }

    async fn on_fetched_publication(
        &mut self,
        key: PublicationKey,
        id: OperationId,
        fetched: Publication,
    ) {
        match self.merge_fetched(fetched).await {
            Ok(snapshot) => {
                self.complete_fetch(&key, id, Completion::Completed(snapshot))
                    .await;
            }
            Err(
                err @ (PublicationError::VersionMismatch { .. }
                | PublicationError::Diff(_)
                | PublicationError::DocumentEvicted
                | PublicationError::DocumentGone),
            ) => {
                // The diffs do not line up with what we hold. Re-fetch the
                // whole copy once before giving up.
                let retry = match self.pending_fetches.head_mut(&key) {
                    Some((head_id, pending)) if head_id == id && !pending.refetched => {
                        pending.refetched = true;
                        Some(pending.meta.clone())
                    }
                    _ => None,
                };
                match retry {
                    Some(meta) => {
                        debug!(%err, name = %meta.name, "fetched diffs do not line up, re-fetching whole copy");
                        let mut header = globalized_header(&self.identity, &meta);
                        header.version = 0;
                        header.lineage = 0;
                        self.spawn_request(
                            id,
                            meta.published_to.clone(),
                            PeerRequest::Get { header },
                        );
                    }
                    None => {
                        let reason = CancelReason::Protocol {
                            code: ERROR_CONFLICT,
                            reason: err.to_string(),
                        };
                        self.complete_fetch(&key, id, Completion::Cancelled(reason))
                            .await;
                    }
                }
            }
            Err(err) => {
                let reason = CancelReason::Transport(TransportError::Custom(err.to_string()));
                self.complete_fetch(&key, id, Completion::Cancelled(reason))
                    .await;
            }
        }
    }

    async fn complete_fetch(
        &mut self,
        key: &PublicationKey,
        id: OperationId,
        completion: Completion<Publication>,
    ) {
        self.operation_keys.remove(&id);
        if let Some((pending, was_head)) = self.pending_fetches.remove(key, id) {
            pending.result_tx.send(completion).ok();
            if was_head {
                self.activate_fetch(key).await;
            }
        }
    }

    /// Merges a publication received off the wire into the remote cache and
    /// returns a snapshot of the resulting entry.
    async fn merge_fetched(
        &mut self,
        fetched: Publication,
    ) -> Result<Publication, PublicationError> {
        let existing_key = self
            .remote
            .iter()
            .find(|(_, cached)| cached.is_matching(fetched.meta(), true))
            .map(|(cached_key, _)| cached_key.clone());

        let Some(existing_key) = existing_key else {
            if fetched.carries_diff() {
                // A diff run with nothing to apply it against.
                return Err(PublicationError::VersionMismatch {
                    expected: 1,
                    got: fetched.base_version(),
                });
            }
            let snapshot = fetched.clone();
            self.remote.insert(fetched.key(), fetched);
            return Ok(snapshot);
        };

        let Some(mut existing) = self.remote.remove(&existing_key) else {
            return Err(PublicationError::DocumentGone);
        };
        if fetched.carries_diff() {
            if let Err(err) = existing.ensure_document(&self.store).await {
                self.remote.insert(existing_key, existing);
                return Err(err);
            }
        }
        match existing.update_from_fetched(&fetched) {
            Ok(()) => {
                let snapshot = existing.clone();
                // The merge may have moved the entry to a new epoch.
                self.remote.insert(existing.key(), existing);
                Ok(snapshot)
            }
            Err(err) => {
                self.remote.insert(existing_key, existing);
                Err(err)
            }
        }
    }

    // Removing

    fn on_remove(
        &mut self,
        id: OperationId,
        meta: PublicationMetaData,
        result_tx: oneshot::Sender<Completion<()>>,
    ) {
        if meta.published_to.is_local() {
            // Local removal is idempotent and always completes.
            for key in self.find_local_keys_matching(&meta, meta.lineage == 0) {
                if let Some(publication) = self.local.remove(&key) {
                    self.permissions.remove(publication.name());
                    self.forget_peer_fetches(&key);
                    self.announce_gone(publication.meta());
                }
            }
            result_tx.send(Completion::Completed(())).ok();
            return;
        }

        self.operation_keys.insert(id, OperationKind::Remove);
        self.pending_removes
            .insert(id, PendingRemove { result_tx });
        let header = globalized_header(&self.identity, &meta);
        self.spawn_request(id, meta.published_to, PeerRequest::Delete { header });
    }

    fn on_remove_resolved(&mut self, id: OperationId, result: Result<PeerResult, TransportError>) {
        self.operation_keys.remove(&id);
        let Some(pending) = self.pending_removes.remove(&id) else {
            return;
        };
        let completion = match result {
            Ok(PeerResult::Delete { .. }) => Completion::Completed(()),
            Ok(PeerResult::Error { code, reason }) => {
                Completion::Cancelled(if code == ERROR_NOT_FOUND {
                    CancelReason::NotFound
                } else {
                    CancelReason::Protocol { code, reason }
                })
            }
            Ok(_) => Completion::Cancelled(CancelReason::UnexpectedResult),
            Err(err) => Completion::Cancelled(CancelReason::Transport(err)),
        };
        pending.result_tx.send(completion).ok();
    }

    // Subscriptions

    fn on_subscribe(
        &mut self,
        id: SubscriptionId,
        location: Location,
        path: String,
        relationships: Relationships,
        events_tx: mpsc::Sender<SubscriptionEvent>,
    ) {
        let subscription = OutgoingSubscription {
            location: location.clone(),
            path: path.clone(),
            relationships: relationships.clone(),
            events_tx,
        };

        if location.is_local() {
            subscription.notify(SubscriptionEvent::State(SubscriptionState::Established));
            // Replay what is already cached.
            for publication in self.local.values() {
                if subscription.matches(publication.meta()) {
                    subscription.notify(SubscriptionEvent::Updated(publication.meta().clone()));
                }
            }
            self.outgoing_subs.insert(id, subscription);
            return;
        }

        subscription.notify(SubscriptionEvent::State(SubscriptionState::Pending));
        self.outgoing_subs.insert(id, subscription);
        self.spawn_subscribe(
            id,
            location,
            PeerRequest::Subscribe {
                path,
                relationships,
            },
        );
    }

    fn on_subscribe_resolved(
        &mut self,
        id: SubscriptionId,
        result: Result<PeerResult, TransportError>,
    ) {
        let Some(subscription) = self.outgoing_subs.get(&id) else {
            return;
        };
        match result {
            Ok(PeerResult::Subscribe { .. }) => {
                subscription.notify(SubscriptionEvent::State(SubscriptionState::Established));
            }
            Ok(PeerResult::Error { code, reason }) => {
                debug!(code, %reason, "subscribe rejected");
                subscription.notify(SubscriptionEvent::State(SubscriptionState::Shutdown));
                self.outgoing_subs.remove(&id);
            }
            Ok(_) | Err(_) => {
                subscription.notify(SubscriptionEvent::State(SubscriptionState::Shutdown));
                self.outgoing_subs.remove(&id);
            }
        }
    }

    // Cancellation

    async fn on_cancel_operation(&mut self, id: OperationId) {
        let Some(kind) = self.operation_keys.remove(&id) else {
            return;
        };
        match kind {
            OperationKind::Publish(key) => {
                if let Some((pending, was_head)) = self.pending_publishes.remove(&key, id) {
                    pending
                        .result_tx
                        .send(Completion::Cancelled(CancelReason::Caller))
                        .ok();
                    if was_head {
                        self.activate_publish(&key);
                    }
                }
            }
            OperationKind::Fetch(key) => {
                if let Some((pending, was_head)) = self.pending_fetches.remove(&key, id) {
                    pending
                        .result_tx
                        .send(Completion::Cancelled(CancelReason::Caller))
                        .ok();
                    if was_head {
                        self.activate_fetch(&key).await;
                    }
                }
            }
            OperationKind::Remove => {
                if let Some(pending) = self.pending_removes.remove(&id) {
                    pending
                        .result_tx
                        .send(Completion::Cancelled(CancelReason::Caller))
                        .ok();
                }
            }
        }
    }

    async fn on_request_resolved(
        &mut self,
        id: OperationId,
        result: Result<PeerResult, TransportError>,
    ) {
        // A cancelled operation loses its routing entry; its late result is
        // dropped here.
        let Some(kind) = self.operation_keys.get(&id).cloned() else {
            trace!(id, "result for unknown operation, dropping it");
            return;
        };
        match kind {
            OperationKind::Publish(key) => self.on_publish_resolved(key, id, result),
            OperationKind::Fetch(key) => self.on_fetch_resolved(key, id, result).await,
            OperationKind::Remove => self.on_remove_resolved(id, result),
        }
    }

    // Incoming peer requests

    async fn on_peer_request(
        &mut self,
        from: Location,
        request: PeerRequest,
    ) -> Option<PeerResult> {
        match request {
            PeerRequest::Publish { header, payload } => {
                self.on_incoming_publish(from, header, payload).await
            }
            PeerRequest::Get { header } => self.on_incoming_get(from, header).await,
            PeerRequest::Delete { header } => self.on_incoming_delete(from, header),
            PeerRequest::Subscribe {
                path,
                relationships,
            } => self.on_incoming_subscribe(from, path, relationships),
            PeerRequest::PublishNotify { header, payload } => {
                self.on_incoming_notify(from, header, payload).await;
                None
            }
        }
    }

    async fn on_incoming_publish(
        &mut self,
        from: Location,
        header: PublicationHeader,
        payload: WirePayload,
    ) -> Option<PeerResult> {
        let mut meta = localized_meta(&self.identity, header);
        // The network says who sent this; the header's claim is not trusted.
        meta.creator = from.clone();
        meta.published_to = Location::Local;

        let contents = match payload.into_contents(meta.base_version) {
            Ok(contents) => contents,
            Err(err) => {
                debug!(%err, peer = %from, "malformed publish payload");
                return Some(PeerResult::error(ERROR_BAD_REQUEST, err.to_string()));
            }
        };
        let incoming = Publication::from_wire(meta, contents);

        let mut accepted = if incoming.carries_diff() {
            let Some(key) = self.find_local_key_matching(incoming.meta(), true) else {
                return Some(PeerResult::error(
                    ERROR_NOT_FOUND,
                    "no publication to apply diffs against",
                ));
            };
            let Some(mut existing) = self.local.remove(&key) else {
                return Some(PeerResult::error(
                    ERROR_NOT_FOUND,
                    "no publication to apply diffs against",
                ));
            };
            if let Err(err) = existing.ensure_document(&self.store).await {
                self.local.insert(key, existing);
                return Some(PeerResult::error(ERROR_CONFLICT, err.to_string()));
            }
            match existing.update_from_fetched(&incoming) {
                Ok(()) => existing,
                Err(err) => {
                    self.local.insert(key, existing);
                    return Some(PeerResult::error(ERROR_CONFLICT, err.to_string()));
                }
            }
        } else {
            // A whole copy replaces every previous epoch of this identity.
            for stale in self.find_local_keys_matching(incoming.meta(), true) {
                self.local.remove(&stale);
            }
            incoming
        };

        self.cache_permission_document(&mut accepted);
        let meta = accepted.meta().clone();
        let key = accepted.key();
        self.local.insert(key.clone(), accepted);
        // The publisher holds this version by construction; never echo the
        // change back at it.
        self.peer_sources
            .entry(from)
            .or_default()
            .fetched
            .insert(key, meta.version);
        self.announce_publication(&meta);

        Some(PeerResult::Publish {
            header: globalized_header(&self.identity, &meta),
        })
    }

    async fn on_incoming_get(
        &mut self,
        from: Location,
        header: PublicationHeader,
    ) -> Option<PeerResult> {
        let requester = localized_meta(&self.identity, header);
        let Some(key) = self.find_local_key_matching(&requester, requester.lineage == 0) else {
            return Some(PeerResult::error(ERROR_NOT_FOUND, "unknown publication"));
        };

        let authorized = self
            .local
            .get(&key)
            .is_some_and(|publication| {
                relationships::can_fetch(&from, publication.meta(), &self.permissions)
            });
        if !authorized {
            debug!(peer = %from, name = %requester.name, "ignoring unauthorized get");
            return None;
        }

        let Some(publication) = self.local.get_mut(&key) else {
            return Some(PeerResult::error(ERROR_NOT_FOUND, "unknown publication"));
        };
        if let Err(err) = publication.ensure_document(&self.store).await {
            warn!(%err, name = %requester.name, "cached document unrecoverable, dropping publication");
            self.local.remove(&key);
            return Some(PeerResult::error(ERROR_NOT_FOUND, "unknown publication"));
        }

        // Send a diff run on top of the version the requester holds when the
        // chain allows it, the whole payload otherwise.
        let current = publication.version();
        let from_version = if requester.lineage == publication.lineage()
            && requester.version > 0
            && requester.version < current
        {
            requester.version + 1
        } else {
            0
        };
        let contents = match publication.contents(from_version, current) {
            Ok(contents) => contents,
            Err(err) => {
                warn!(%err, name = %requester.name, "cannot prepare publication contents");
                return Some(PeerResult::error(ERROR_NOT_FOUND, "unknown publication"));
            }
        };
        let meta = publication.meta().clone();

        self.peer_sources
            .entry(from)
            .or_default()
            .fetched
            .insert(key, current);

        let mut header = globalized_header(&self.identity, &meta);
        header.base_version = contents.base_version();
        Some(PeerResult::Get {
            header,
            payload: WirePayload::from_contents(&contents),
        })
    }

    fn on_incoming_delete(
        &mut self,
        from: Location,
        header: PublicationHeader,
    ) -> Option<PeerResult> {
        let mut target = localized_meta(&self.identity, header);
        // Peers may only delete what they created.
        target.creator = from;
        target.published_to = Location::Local;

        let keys = self.find_local_keys_matching(&target, target.lineage == 0);
        if keys.is_empty() {
            return Some(PeerResult::error(ERROR_NOT_FOUND, "unknown publication"));
        }

        let mut last_meta = target;
        for key in keys {
            if let Some(publication) = self.local.remove(&key) {
                self.permissions.remove(publication.name());
                self.forget_peer_fetches(&key);
                last_meta = publication.meta().clone();
                self.announce_gone(&last_meta);
            }
        }

        Some(PeerResult::Delete {
            header: globalized_header(&self.identity, &last_meta),
        })
    }

    fn on_incoming_subscribe(
        &mut self,
        from: Location,
        path: String,
        relationships: Relationships,
    ) -> Option<PeerResult> {
        let subscription = IncomingSubscription {
            source: from.clone(),
            path: path.clone(),
            relationships,
        };

        // Replay already-cached matching publications the subscriber has not
        // seen yet.
        for (key, publication) in &self.local {
            let meta = publication.meta();
            if !relationships::can_subscribe(
                &subscription.source,
                meta,
                &subscription.path,
                &self.permissions,
            ) {
                continue;
            }
            if !relationship_names_match(&subscription.relationships, &meta.relationships) {
                continue;
            }
            if self.peer_has_version(&subscription.source, key, meta.version) {
                continue;
            }
            self.spawn_notify(
                subscription.source.clone(),
                PeerRequest::PublishNotify {
                    header: globalized_header(&self.identity, meta),
                    payload: None,
                },
            );
        }

        self.incoming_subs.insert((from, path.clone()), subscription);
        Some(PeerResult::Subscribe { path })
    }

    async fn on_incoming_notify(
        &mut self,
        from: Location,
        header: PublicationHeader,
        payload: Option<WirePayload>,
    ) {
        let mut meta = localized_meta(&self.identity, header);
        // The notifying location owns the publication.
        meta.published_to = from.clone();

        if let Some(payload) = payload {
            match payload.into_contents(meta.base_version) {
                Ok(contents) => {
                    let fetched = Publication::from_wire(meta.clone(), contents);
                    if let Err(err) = self.merge_fetched(fetched).await {
                        debug!(%err, name = %meta.name, "notify payload does not line up, ignoring it");
                    }
                }
                Err(err) => {
                    debug!(%err, peer = %from, "malformed notify payload, ignoring it");
                }
            }
        }

        for subscription in self.outgoing_subs.values() {
            if same_source(&subscription.location, &from) && subscription.matches(&meta) {
                subscription.notify(SubscriptionEvent::Updated(meta.clone()));
            }
        }
    }

    // Connection lifecycle

    fn on_connection_changed(&mut self, location: Location, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                // The peer is back inside the grace window: its cached data
                // stays.
                for publication in self.remote.values_mut() {
                    if same_source(publication.published_to(), &location) {
                        publication.set_cache_expires(None);
                    }
                }
                for (source, peer) in self.peer_sources.iter_mut() {
                    if same_source(source, &location) {
                        peer.expires = None;
                    }
                }
            }
            state if state.is_disconnected() => {
                debug!(%location, "peer disconnected, purging its publications");

                // Publications the peer published into us are its presence
                // here; they go at once.
                let created: Vec<PublicationKey> = self
                    .local
                    .iter()
                    .filter(|(_, publication)| same_source(publication.creator(), &location))
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in created {
                    if let Some(publication) = self.local.remove(&key) {
                        self.permissions.remove(publication.name());
                        self.forget_peer_fetches(&key);
                        self.announce_gone(publication.meta());
                    }
                }

                // Copies fetched from the peer survive for the grace window.
                let grace =
                    current_timestamp() + self.config.disconnect_grace.as_secs();
                for publication in self.remote.values_mut() {
                    if same_source(publication.published_to(), &location) {
                        publication.set_cache_expires(Some(grace));
                    }
                }

                if location.is_finder() {
                    // Finder sources are rendezvous state, gone with the
                    // connection.
                    self.peer_sources
                        .retain(|source, _| !source.is_finder());
                } else {
                    for (source, peer) in self.peer_sources.iter_mut() {
                        if same_source(source, &location) {
                            peer.expires = Some(grace);
                        }
                    }
                }

                let ended: Vec<SubscriptionId> = self
                    .outgoing_subs
                    .iter()
                    .filter(|(_, sub)| same_source(&sub.location, &location))
                    .map(|(id, _)| *id)
                    .collect();
                for id in ended {
                    if let Some(subscription) = self.outgoing_subs.remove(&id) {
                        subscription
                            .notify(SubscriptionEvent::State(SubscriptionState::Shutdown));
                    }
                }
                self.incoming_subs
                    .retain(|(source, _), _| !same_source(source, &location));
            }
            _ => (),
        }
    }

    // Housekeeping

    async fn on_sweep(&mut self) {
        let now = current_timestamp();

        let expired: Vec<PublicationKey> = self
            .remote
            .iter()
            .filter(|(_, publication)| publication.meta().is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(publication) = self.remote.remove(&key) {
                debug!(name = %publication.name(), "dropping expired cached publication");
            }
        }

        self.peer_sources
            .retain(|_, peer| !peer.expires.is_some_and(|expiry| expiry <= now));

        // Park document bodies nobody touched for a while.
        let idle = self.config.document_idle;
        for (key, publication) in self.local.iter_mut().chain(self.remote.iter_mut()) {
            if publication
                .idle_duration()
                .is_some_and(|duration| duration >= idle)
            {
                let cache_key = document_cache_key(key);
                if let Err(err) = publication.evict_document(&cache_key, &self.store).await {
                    warn!(%err, name = %publication.name(), "failed to park idle document");
                }
            }
        }

        if let Err(err) = self.store.prune().await {
            warn!(%err, "failed to prune cache store");
        }
    }

    fn shutdown(&mut self) {
        for pending in self.pending_publishes.drain() {
            pending
                .result_tx
                .send(Completion::Cancelled(CancelReason::Shutdown))
                .ok();
        }
        for pending in self.pending_fetches.drain() {
            pending
                .result_tx
                .send(Completion::Cancelled(CancelReason::Shutdown))
                .ok();
        }
        for (_, pending) in std::mem::take(&mut self.pending_removes) {
            pending
                .result_tx
                .send(Completion::Cancelled(CancelReason::Shutdown))
                .ok();
        }
        self.operation_keys.clear();
        for (_, subscription) in std::mem::take(&mut self.outgoing_subs) {
            subscription.notify(SubscriptionEvent::State(SubscriptionState::Shutdown));
        }
        self.incoming_subs.clear();
    }

    // Cache helpers

    async fn local_snapshot(&mut self, meta: &PublicationMetaData) -> Option<Publication> {
        let key = self.find_local_key_matching(meta, meta.lineage == 0)?;
        let publication = self.local.get_mut(&key)?;
        match publication.ensure_document(&self.store).await {
            Ok(()) => Some(publication.clone()),
            Err(err) => {
                warn!(%err, name = %meta.name, "cached document unrecoverable, dropping publication");
                self.local.remove(&key);
                None
            }
        }
    }

    /// A snapshot of the cached remote copy, when it is at least as new as
    /// the requested version. Version 0 is satisfied by any cached copy.
    async fn remote_snapshot_satisfying(
        &mut self,
        meta: &PublicationMetaData,
    ) -> Option<Publication> {
        let key = self.find_remote_key_matching(meta, meta.lineage == 0)?;
        let satisfied = self
            .remote
            .get(&key)
            .is_some_and(|cached| cached.version() >= meta.version);
        if !satisfied {
            return None;
        }
        let cached = self.remote.get_mut(&key)?;
        match cached.ensure_document(&self.store).await {
            Ok(()) => Some(cached.clone()),
            Err(err) => {
                warn!(%err, name = %meta.name, "cached document unrecoverable, dropping publication");
                self.remote.remove(&key);
                None
            }
        }
    }

    fn find_local_key_matching(
        &self,
        meta: &PublicationMetaData,
        ignore_lineage: bool,
    ) -> Option<PublicationKey> {
        self.local
            .values()
            .find(|publication| publication.is_matching(meta, ignore_lineage))
            .map(|publication| publication.key())
    }

    fn find_local_keys_matching(
        &self,
        meta: &PublicationMetaData,
        ignore_lineage: bool,
    ) -> Vec<PublicationKey> {
        self.local
            .values()
            .filter(|publication| publication.is_matching(meta, ignore_lineage))
            .map(|publication| publication.key())
            .collect()
    }

    fn find_remote_key_matching(
        &self,
        meta: &PublicationMetaData,
        ignore_lineage: bool,
    ) -> Option<PublicationKey> {
        self.remote
            .values()
            .find(|publication| publication.is_matching(meta, ignore_lineage))
            .map(|publication| publication.key())
    }

    /// Keeps the relationship-document cache in step with the local cache.
    fn cache_permission_document(&mut self, publication: &mut Publication) {
        if publication.encoding() != Encoding::Json {
            return;
        }
        let name = publication.name().to_string();
        if let Ok(document) = publication.document() {
            self.permissions.insert(name, document.clone());
        }
    }

    fn forget_peer_fetches(&mut self, key: &PublicationKey) {
        for peer in self.peer_sources.values_mut() {
            peer.fetched.remove(key);
        }
    }

    fn peer_has_version(&self, source: &Location, key: &PublicationKey, version: u64) -> bool {
        self.peer_sources
            .get(source)
            .and_then(|peer| peer.fetched.get(key))
            .is_some_and(|&held| held >= version)
    }

    // Fan-out

    /// Tells local subscribers and subscribed peers about a new or changed
    /// local publication.
    fn announce_publication(&mut self, meta: &PublicationMetaData) {
        for subscription in self.outgoing_subs.values() {
            if subscription.location.is_local() && subscription.matches(meta) {
                subscription.notify(SubscriptionEvent::Updated(meta.clone()));
            }
        }

        let key = meta.key();
        let interested: Vec<Location> = self
            .incoming_subs
            .values()
            .filter(|sub| {
                relationships::can_subscribe(&sub.source, meta, &sub.path, &self.permissions)
            })
            .filter(|sub| relationship_names_match(&sub.relationships, &meta.relationships))
            .filter(|sub| !self.peer_has_version(&sub.source, &key, meta.version))
            .map(|sub| sub.source.clone())
            .collect();
        for to in interested {
            let header = globalized_header(&self.identity, meta);
            self.spawn_notify(
                to,
                PeerRequest::PublishNotify {
                    header,
                    payload: None,
                },
            );
        }
    }

    fn announce_gone(&self, meta: &PublicationMetaData) {
        for subscription in self.outgoing_subs.values() {
            if subscription.location.is_local() && subscription.matches(meta) {
                subscription.notify(SubscriptionEvent::Gone(meta.clone()));
            }
        }
    }

    // Transport plumbing

    /// Sends a request off the actor loop; the result comes back through the
    /// inbox.
    fn spawn_request(&self, id: OperationId, to: Location, request: PeerRequest) {
        let transport = self.transport.clone();
        let actor_tx = self.actor_tx.clone();
        tokio::task::spawn(async move {
            let result = transport.request(to, request).await;
            if actor_tx
                .send(ToRepositoryActor::RequestResolved { id, result })
                .await
                .is_err()
            {
                trace!("repository actor gone before request resolved");
            }
        });
    }

    fn spawn_subscribe(&self, id: SubscriptionId, to: Location, request: PeerRequest) {
        let transport = self.transport.clone();
        let actor_tx = self.actor_tx.clone();
        tokio::task::spawn(async move {
            let result = transport.request(to, request).await;
            if actor_tx
                .send(ToRepositoryActor::SubscribeResolved { id, result })
                .await
                .is_err()
            {
                trace!("repository actor gone before subscribe resolved");
            }
        });
    }

    fn spawn_notify(&self, to: Location, request: PeerRequest) {
        let transport = self.transport.clone();
        tokio::task::spawn(async move {
            if let Err(err) = transport.notify(to, request).await {
                debug!(%err, "failed to deliver notification");
            }
        });
    }
}

/// Rewrites a wire location into this repository's frame of reference.
fn localize(identity: &Location, location: Location) -> Location {
    if &location == identity {
        Location::Local
    } else {
        location
    }
}

/// Rewrites a location for the wire, naming ourselves explicitly.
fn globalize(identity: &Location, location: Location) -> Location {
    if location.is_local() {
        identity.clone()
    } else {
        location
    }
}

fn localized_meta(identity: &Location, header: PublicationHeader) -> PublicationMetaData {
    let mut meta = header.into_meta();
    meta.creator = localize(identity, meta.creator);
    meta.published_to = localize(identity, meta.published_to);
    meta
}

fn globalized_header(identity: &Location, meta: &PublicationMetaData) -> PublicationHeader {
    let mut header = PublicationHeader::from_meta(meta);
    header.creator = globalize(identity, header.creator);
    header.published_to = globalize(identity, header.published_to);
    header
}

/// Same endpoint comparison at disconnect granularity: peers compare by peer
/// identity, finder locations match each other.
fn same_source(a: &Location, b: &Location) -> bool {
    match (a, b) {
        (Location::Finder, Location::Finder) => true,
        _ => a.is_same_peer(b),
    }
}

fn document_cache_key(key: &PublicationKey) -> String {
    format!(
        "publications/{}/{}/{}/{}",
        key.published_to, key.creator, key.name, key.lineage
    )
}
