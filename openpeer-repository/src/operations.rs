// SPDX-License-Identifier: MIT OR Apache-2.0

//! Caller-side handles for publish, fetch and remove operations.
//!
//! Every operation ends in exactly one terminal [`Completion`], delivered
//! through a oneshot channel. Cancelling is a message to the repository
//! actor; a cancel which races the completion is a no-op.

use std::collections::{BTreeMap, VecDeque};

use openpeer_core::{Publication, PublicationKey};
use tokio::sync::{mpsc, oneshot};

use crate::actor::ToRepositoryActor;
use crate::traits::TransportError;

/// Identifier of one repository operation, unique per repository handle.
pub type OperationId = u64;

/// Why an operation ended without completing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller cancelled it.
    Caller,

    /// The publication was not found where it was expected.
    NotFound,

    /// The remote replied with a structured protocol error.
    Protocol { code: u16, reason: String },

    /// The transport could not deliver the request or resolve its result.
    Transport(TransportError),

    /// The remote replied with something that does not answer the request.
    UnexpectedResult,

    /// The repository shut down before the operation resolved.
    Shutdown,
}

/// Terminal outcome of a repository operation.
#[derive(Debug)]
pub enum Completion<T> {
    Completed(T),
    Cancelled(CancelReason),
}

impl<T> Completion<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Cancelled(_) => None,
        }
    }

    pub fn cancel_reason(&self) -> Option<&CancelReason> {
        match self {
            Self::Completed(_) => None,
            Self::Cancelled(reason) => Some(reason),
        }
    }
}

/// Handle of a pending publish operation.
///
/// Completes with the published publication, its base version advanced to
/// the version the published location acknowledged.
#[derive(Debug)]
pub struct Publisher {
    id: OperationId,
    actor_tx: mpsc::Sender<ToRepositoryActor>,
    result_rx: oneshot::Receiver<Completion<Publication>>,
}

impl Publisher {
    pub(crate) fn new(
        id: OperationId,
        actor_tx: mpsc::Sender<ToRepositoryActor>,
        result_rx: oneshot::Receiver<Completion<Publication>>,
    ) -> Self {
        Self {
            id,
            actor_tx,
            result_rx,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Waits for the terminal outcome.
    pub async fn result(self) -> Completion<Publication> {
        match self.result_rx.await {
            Ok(completion) => completion,
            Err(_) => Completion::Cancelled(CancelReason::Shutdown),
        }
    }

    /// Cancels the operation.
    pub async fn cancel(&self) {
        let _ = self
            .actor_tx
            .send(ToRepositoryActor::CancelOperation { id: self.id })
            .await;
    }
}

/// Handle of a pending fetch operation, completing with a snapshot of the
/// fetched publication.
#[derive(Debug)]
pub struct Fetcher {
    id: OperationId,
    actor_tx: mpsc::Sender<ToRepositoryActor>,
    result_rx: oneshot::Receiver<Completion<Publication>>,
}

impl Fetcher {
    pub(crate) fn new(
        id: OperationId,
        actor_tx: mpsc::Sender<ToRepositoryActor>,
        result_rx: oneshot::Receiver<Completion<Publication>>,
    ) -> Self {
        Self {
            id,
            actor_tx,
            result_rx,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub async fn result(self) -> Completion<Publication> {
        match self.result_rx.await {
            Ok(completion) => completion,
            Err(_) => Completion::Cancelled(CancelReason::Shutdown),
        }
    }

    pub async fn cancel(&self) {
        let _ = self
            .actor_tx
            .send(ToRepositoryActor::CancelOperation { id: self.id })
            .await;
    }
}

/// Handle of a pending remove operation.
#[derive(Debug)]
pub struct Remover {
    id: OperationId,
    actor_tx: mpsc::Sender<ToRepositoryActor>,
    result_rx: oneshot::Receiver<Completion<()>>,
}

impl Remover {
    pub(crate) fn new(
        id: OperationId,
        actor_tx: mpsc::Sender<ToRepositoryActor>,
        result_rx: oneshot::Receiver<Completion<()>>,
    ) -> Self {
        Self {
            id,
            actor_tx,
            result_rx,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub async fn result(self) -> Completion<()> {
        match self.result_rx.await {
            Ok(completion) => completion,
            Err(_) => Completion::Cancelled(CancelReason::Shutdown),
        }
    }

    pub async fn cancel(&self) {
        let _ = self
            .actor_tx
            .send(ToRepositoryActor::CancelOperation { id: self.id })
            .await;
    }
}

/// FIFO queues of pending operations, one per publication identity.
///
/// The head of a queue is the activated entry, the one with a message in
/// flight; everything behind it waits. Removing the head (completion or
/// cancellation) makes the next entry eligible for activation.
#[derive(Debug)]
pub(crate) struct PendingQueue<P> {
    queues: BTreeMap<PublicationKey, VecDeque<(OperationId, P)>>,
}

impl<P> PendingQueue<P> {
    pub fn new() -> Self {
        Self {
            queues: BTreeMap::new(),
        }
    }

    /// Appends an entry; true when it landed at the head and needs
    /// activating.
    pub fn push(&mut self, key: PublicationKey, id: OperationId, entry: P) -> bool {
        let queue = self.queues.entry(key).or_default();
        queue.push_back((id, entry));
        queue.len() == 1
    }

    pub fn head(&self, key: &PublicationKey) -> Option<(OperationId, &P)> {
        self.queues
            .get(key)
            .and_then(|queue| queue.front())
            .map(|(id, entry)| (*id, entry))
    }

    pub fn head_mut(&mut self, key: &PublicationKey) -> Option<(OperationId, &mut P)> {
        self.queues
            .get_mut(key)
            .and_then(|queue| queue.front_mut())
            .map(|(id, entry)| (*id, entry))
    }

    /// Removes the entry with `id` wherever it sits in the identity's queue.
    /// The second value is true when the head was removed.
    pub fn remove(&mut self, key: &PublicationKey, id: OperationId) -> Option<(P, bool)> {
        let queue = self.queues.get_mut(key)?;
        let position = queue.iter().position(|(entry_id, _)| *entry_id == id)?;
        let (_, entry) = queue.remove(position)?;
        if queue.is_empty() {
            self.queues.remove(key);
        }
        Some((entry, position == 0))
    }

    /// Empties every queue, in identity order.
    pub fn drain(&mut self) -> Vec<P> {
        std::mem::take(&mut self.queues)
            .into_values()
            .flatten()
            .map(|(_, entry)| entry)
            .collect()
    }
}
