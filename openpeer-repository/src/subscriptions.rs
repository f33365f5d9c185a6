// SPDX-License-Identifier: MIT OR Apache-2.0

//! Subscription handles and the actor-side subscription registries.

use openpeer_core::{Location, PublicationMetaData, Relationships};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{trace, warn};

use crate::actor::ToRepositoryActor;

/// Identifier of one subscription, unique per repository handle.
pub type SubscriptionId = u64;

/// Lifecycle state of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Registered locally, remote acknowledgement outstanding.
    Pending,

    /// Live; update events flow.
    Established,

    /// Ended. No further events follow.
    Shutdown,
}

/// Events delivered to a subscriber.
#[derive(Clone, Debug)]
pub enum SubscriptionEvent {
    /// Lifecycle change of the subscription itself.
    State(SubscriptionState),

    /// A matching publication appeared or changed. Carries metadata only;
    /// interested subscribers fetch the contents.
    Updated(PublicationMetaData),

    /// A matching publication was removed or purged.
    Gone(PublicationMetaData),
}

/// Caller-side handle of a subscription.
///
/// Dropping the handle without cancelling leaves the registration in place
/// until the repository shuts down; events are then discarded.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    actor_tx: mpsc::Sender<ToRepositoryActor>,
    events_rx: mpsc::Receiver<SubscriptionEvent>,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        actor_tx: mpsc::Sender<ToRepositoryActor>,
        events_rx: mpsc::Receiver<SubscriptionEvent>,
    ) -> Self {
        Self {
            id,
            actor_tx,
            events_rx,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next subscription event. `None` once the subscription ended and all
    /// buffered events were drained.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.events_rx.recv().await
    }

    /// Ends the subscription. Buffered events stay readable.
    pub async fn cancel(&self) {
        let _ = self
            .actor_tx
            .send(ToRepositoryActor::CancelSubscription { id: self.id })
            .await;
    }

    /// Turns the handle into a plain event stream, giving up the ability to
    /// cancel.
    pub fn into_stream(self) -> ReceiverStream<SubscriptionEvent> {
        ReceiverStream::new(self.events_rx)
    }
}

/// Actor-side record of a subscription made by a local caller.
#[derive(Debug)]
pub(crate) struct OutgoingSubscription {
    pub location: Location,
    pub path: String,
    pub relationships: Relationships,
    pub events_tx: mpsc::Sender<SubscriptionEvent>,
}

impl OutgoingSubscription {
    /// Whether a publication falls under this subscription's path and
    /// relationship filter.
    pub fn matches(&self, meta: &PublicationMetaData) -> bool {
        meta.name.starts_with(&self.path)
            && relationship_names_match(&self.relationships, &meta.relationships)
    }

    /// Delivers an event without blocking the actor. A full channel drops
    /// the event, a closed one means the subscriber went away.
    pub fn notify(&self, event: SubscriptionEvent) {
        match self.events_tx.try_send(event) {
            Ok(()) => (),
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "subscriber not keeping up, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("subscriber handle dropped");
            }
        }
    }
}

/// Actor-side record of a subscription a remote peer registered with us.
#[derive(Clone, Debug)]
pub(crate) struct IncomingSubscription {
    pub source: Location,
    pub path: String,
    pub relationships: Relationships,
}

/// An empty subscription filter matches everything; a non-empty one requires
/// at least one shared relationship name with the publication.
pub(crate) fn relationship_names_match(
    subscription: &Relationships,
    publication: &Relationships,
) -> bool {
    subscription.is_empty() || publication.keys().any(|name| subscription.contains_key(name))
}

#[cfg(test)]
mod tests {
    use openpeer_core::{Permission, RelationshipEntry};

    use super::*;

    #[test]
    fn relationship_filter() {
        let empty = Relationships::new();
        let friends = Relationships::from([(
            "friends".to_string(),
            RelationshipEntry::new(Permission::All, []),
        )]);
        let family = Relationships::from([(
            "family".to_string(),
            RelationshipEntry::new(Permission::All, []),
        )]);

        assert!(relationship_names_match(&empty, &friends));
        assert!(relationship_names_match(&friends, &friends));
        assert!(!relationship_names_match(&family, &friends));
        // Publications without relationships only match unfiltered
        // subscriptions.
        assert!(relationship_names_match(&empty, &empty));
        assert!(!relationship_names_match(&friends, &empty));
    }
}
