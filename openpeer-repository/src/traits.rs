// SPDX-License-Identifier: MIT OR Apache-2.0

use openpeer_core::Location;
use thiserror::Error;

use crate::message::{PeerRequest, PeerResult};

/// Delivers peer messages on behalf of a repository.
///
/// Implementations own routing, connection management and per-request
/// timeouts; the repository only distinguishes a typed result from a
/// transport failure. A request which is silently ignored by the remote
/// surfaces here as [`TransportError::Timeout`].
pub trait MessageTransport {
    /// Sends a request and resolves with the result the remote replied.
    fn request(
        &self,
        to: Location,
        request: PeerRequest,
    ) -> impl Future<Output = Result<PeerResult, TransportError>> + Send;

    /// Sends a notification nobody replies to.
    fn notify(
        &self,
        to: Location,
        request: PeerRequest,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no route to {0}")]
    NoRoute(Location),

    #[error("request timed out")]
    Timeout,

    #[error("peer disconnected")]
    Disconnected,

    #[error("custom error: {0}")]
    Custom(String),
}
