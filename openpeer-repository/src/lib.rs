// SPDX-License-Identifier: MIT OR Apache-2.0

//! Peer-to-peer publication repository.
//!
//! A [`Repository`] holds two caches of [`Publication`]s: the local cache
//! with everything published _into_ this repository (by the application or
//! by connected peers) and the remote cache with copies fetched _from_ other
//! locations. All state lives inside one actor task; the `Repository` handle
//! is a cheap clone that talks to it.
//!
//! Publications are addressed by their identity (name, creator and location)
//! plus a lineage stamp separating publish epochs. Repositories exchange
//! them as JSON messages over a caller-provided [`MessageTransport`]; where
//! the version chain allows it, only the diffs on top of what the other side
//! already holds travel across the wire.
//!
//! Remote operations return handles ([`Publisher`], [`Fetcher`], [`Remover`])
//! which resolve to a [`Completion`]: either the completed value or the
//! reason the operation was cancelled. Operations on the same publication
//! identity queue behind each other with at most one message in flight.
//!
//! Subscriptions ([`Repository::subscribe`]) watch a path prefix at a
//! location and report matching publications as they appear, change or go
//! away. Whether a peer gets to see a publication at all is governed by the
//! publication's relationships, resolved against named contact-list
//! documents.
//!
//! [`Publication`]: openpeer_core::Publication

mod actor;
pub mod config;
pub mod message;
pub mod operations;
mod relationships;
pub mod repository;
pub mod subscriptions;
pub mod traits;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
#[cfg(test)]
mod tests;

pub use config::RepositoryConfig;
pub use message::{PeerRequest, PeerResult, PublicationHeader, WirePayload};
pub use operations::{CancelReason, Completion, Fetcher, OperationId, Publisher, Remover};
pub use repository::{Repository, RepositoryError};
pub use subscriptions::{Subscription, SubscriptionEvent, SubscriptionId, SubscriptionState};
pub use traits::{MessageTransport, TransportError};
