// SPDX-License-Identifier: MIT OR Apache-2.0

//! Handle to a running publication repository.
//!
//! All repository state lives inside a dedicated actor task; this handle is a
//! cheap, cloneable front sending messages into it. Operations which involve
//! a remote location hand back an operation handle ([`Publisher`],
//! [`Fetcher`], [`Remover`]) whose result can be awaited or cancelled
//! independently of the call that started it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use openpeer_core::{ConnectionState, Location, Publication, PublicationMetaData, Relationships};
use openpeer_store::CacheStore;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task;

use crate::actor::{RepositoryActor, ToRepositoryActor};
use crate::config::{DEFAULT_CHANNEL_CAPACITY, RepositoryConfig};
use crate::message::{ERROR_BAD_REQUEST, PeerRequest, PeerResult};
use crate::operations::{Fetcher, Publisher, Remover};
use crate::subscriptions::Subscription;
use crate::traits::MessageTransport;

#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The repository actor is no longer running.
    #[error("repository actor has shut down")]
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct Repository {
    actor_tx: mpsc::Sender<ToRepositoryActor>,
    next_id: Arc<AtomicU64>,
}

impl Repository {
    /// Spawns the repository actor and returns a handle to it.
    ///
    /// `identity` is the location under which peers address this repository;
    /// it is used to translate between wire locations (which name every peer
    /// explicitly) and the local frame of reference.
    pub fn spawn<T, S>(
        identity: Location,
        config: RepositoryConfig,
        transport: T,
        store: S,
    ) -> Self
    where
        T: MessageTransport + Send + Sync + 'static,
        S: CacheStore + Send + Sync + 'static,
    {
        let (actor_tx, inbox) = mpsc::channel(config.channel_capacity);
        let actor = RepositoryActor::new(
            identity,
            config,
            transport,
            store,
            inbox,
            actor_tx.clone(),
        );
        task::spawn(actor.run());

        Self {
            actor_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Publishes into the local cache or towards the publication's
    /// `published_to` location.
    ///
    /// Local publishes complete immediately. Remote publishes queue behind
    /// earlier publishes of the same publication identity; at most one
    /// message per identity is on the wire at a time. The completed
    /// publication carries the base version acknowledged by the remote, so
    /// publishing it again only sends the diffs recorded since.
    pub async fn publish(&self, publication: Publication) -> Result<Publisher, RepositoryError> {
        let id = self.next_id();
        let (result_tx, result_rx) = oneshot::channel();
        self.actor_tx
            .send(ToRepositoryActor::Publish {
                id,
                publication,
                result_tx,
            })
            .await
            .map_err(|_| RepositoryError::Shutdown)?;
        Ok(Publisher::new(id, self.actor_tx.clone(), result_rx))
    }

    /// Fetches the publication described by `meta` from its `published_to`
    /// location.
    ///
    /// A cached copy at or above `meta.version` completes the fetch without
    /// touching the network; version 0 is satisfied by any cached copy.
    /// Fetches of the same publication identity queue behind each other and
    /// a queued fetch is completed by the in-flight result when that result
    /// satisfies it.
    pub async fn fetch(&self, meta: PublicationMetaData) -> Result<Fetcher, RepositoryError> {
        let id = self.next_id();
        let (result_tx, result_rx) = oneshot::channel();
        self.actor_tx
            .send(ToRepositoryActor::Fetch {
                id,
                meta,
                result_tx,
            })
            .await
            .map_err(|_| RepositoryError::Shutdown)?;
        Ok(Fetcher::new(id, self.actor_tx.clone(), result_rx))
    }

    /// Removes the publication described by `meta`.
    ///
    /// Local removal is idempotent and always completes. For a remote
    /// location a delete message is sent and the handle resolves with the
    /// remote's answer.
    pub async fn remove(&self, meta: PublicationMetaData) -> Result<Remover, RepositoryError> {
        let id = self.next_id();
        let (result_tx, result_rx) = oneshot::channel();
        self.actor_tx
            .send(ToRepositoryActor::Remove {
                id,
                meta,
                result_tx,
            })
            .await
            .map_err(|_| RepositoryError::Shutdown)?;
        Ok(Remover::new(id, self.actor_tx.clone(), result_rx))
    }

    /// Subscribes to publications under a path prefix at the given location.
    ///
    /// Local subscriptions observe the local cache and establish right away.
    /// Remote subscriptions send a subscribe message and report their state
    /// through the event stream. A non-empty `relationships` map narrows the
    /// subscription to publications sharing at least one relationship name.
    pub async fn subscribe(
        &self,
        location: Location,
        path: impl Into<String>,
        relationships: Relationships,
    ) -> Result<Subscription, RepositoryError> {
        let id = self.next_id();
        let (events_tx, events_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        self.actor_tx
            .send(ToRepositoryActor::Subscribe {
                id,
                location,
                path: path.into(),
                relationships,
                events_tx,
            })
            .await
            .map_err(|_| RepositoryError::Shutdown)?;
        Ok(Subscription::new(id, self.actor_tx.clone(), events_rx))
    }

    /// Hands a request received from a peer to the repository.
    ///
    /// `from` is the authenticated location the transport received the
    /// request from; it overrides whatever the request claims about its
    /// sender. `None` means the request was dropped without an answer, which
    /// is how unauthorized requests and notifications end.
    pub async fn handle_request(
        &self,
        from: Location,
        request: PeerRequest,
    ) -> Result<Option<PeerResult>, RepositoryError> {
        let (reply, reply_rx) = oneshot::channel();
        self.actor_tx
            .send(ToRepositoryActor::PeerRequest {
                from,
                request,
                reply,
            })
            .await
            .map_err(|_| RepositoryError::Shutdown)?;
        reply_rx.await.map_err(|_| RepositoryError::Shutdown)
    }

    /// Byte-level variant of [`handle_request`](Self::handle_request) for
    /// transports which do not decode messages themselves.
    pub async fn handle_message(
        &self,
        from: Location,
        bytes: &[u8],
    ) -> Result<Option<Vec<u8>>, RepositoryError> {
        match PeerRequest::from_bytes(bytes) {
            Ok(request) => {
                let result = self.handle_request(from, request).await?;
                Ok(result.map(|result| result.to_bytes()))
            }
            Err(err) => {
                Ok(Some(PeerResult::error(ERROR_BAD_REQUEST, err.to_string()).to_bytes()))
            }
        }
    }

    /// Informs the repository about a connection state change of a location.
    ///
    /// On disconnect the peer's publications are purged, its cached copies
    /// get a grace expiry and its subscriptions end. Reconnecting within the
    /// grace window clears the expiry again.
    pub async fn connection_changed(
        &self,
        location: Location,
        state: ConnectionState,
    ) -> Result<(), RepositoryError> {
        self.actor_tx
            .send(ToRepositoryActor::ConnectionChanged { location, state })
            .await
            .map_err(|_| RepositoryError::Shutdown)
    }

    /// Metadata of every publication currently in the local cache.
    pub async fn local_publications(&self) -> Result<Vec<PublicationMetaData>, RepositoryError> {
        let (reply, reply_rx) = oneshot::channel();
        self.actor_tx
            .send(ToRepositoryActor::LocalPublications { reply })
            .await
            .map_err(|_| RepositoryError::Shutdown)?;
        reply_rx.await.map_err(|_| RepositoryError::Shutdown)
    }

    /// Metadata of every fetched copy currently in the remote cache.
    pub async fn remote_publications(&self) -> Result<Vec<PublicationMetaData>, RepositoryError> {
        let (reply, reply_rx) = oneshot::channel();
        self.actor_tx
            .send(ToRepositoryActor::RemotePublications { reply })
            .await
            .map_err(|_| RepositoryError::Shutdown)?;
        reply_rx.await.map_err(|_| RepositoryError::Shutdown)
    }

    /// Runs one housekeeping sweep immediately instead of waiting for the
    /// interval.
    #[cfg(any(test, feature = "test_utils"))]
    pub async fn sweep(&self) -> Result<(), RepositoryError> {
        let (reply, reply_rx) = oneshot::channel();
        self.actor_tx
            .send(ToRepositoryActor::Sweep { reply })
            .await
            .map_err(|_| RepositoryError::Shutdown)?;
        reply_rx.await.map_err(|_| RepositoryError::Shutdown)
    }

    /// Shuts the repository down. Pending operations cancel and subscription
    /// streams end.
    pub async fn shutdown(&self) -> Result<(), RepositoryError> {
        let (reply, reply_rx) = oneshot::channel();
        self.actor_tx
            .send(ToRepositoryActor::Shutdown { reply })
            .await
            .map_err(|_| RepositoryError::Shutdown)?;
        reply_rx.await.map_err(|_| RepositoryError::Shutdown)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}
