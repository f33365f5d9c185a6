// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire messages exchanged between publication repositories.
//!
//! Messages are JSON-encoded. Binary publication payloads travel as base64
//! strings, structured payloads as embedded JSON documents. A document
//! payload together with a non-zero base version in the header is a diff run
//! against the receiver's copy.

use base64::Engine;
use openpeer_core::{
    Contents, Document, Encoding, Location, PublicationMetaData, Relationships,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol error code replied when a request is malformed.
pub const ERROR_BAD_REQUEST: u16 = 400;

/// Protocol error code replied when the addressed publication is unknown.
pub const ERROR_NOT_FOUND: u16 = 404;

/// Protocol error code replied when a diff does not line up with the
/// receiver's version.
pub const ERROR_CONFLICT: u16 = 409;

/// Publication identity and versioning information attached to every peer
/// message.
///
/// Locations inside a header are always written from the sender's point of
/// view, so `Local` refers to the sending repository. Receivers rewrite them
/// into their own frame of reference before touching any cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublicationHeader {
    pub name: String,
    pub mime_type: String,
    pub encoding: Encoding,
    pub version: u64,
    pub base_version: u64,
    pub lineage: u64,
    pub creator: Location,
    pub published_to: Location,
    pub relationships: Relationships,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_expires: Option<u64>,
}

impl PublicationHeader {
    pub fn from_meta(meta: &PublicationMetaData) -> Self {
        Self {
            name: meta.name.clone(),
            mime_type: meta.mime_type.clone(),
            encoding: meta.encoding,
            version: meta.version,
            base_version: meta.base_version,
            lineage: meta.lineage,
            creator: meta.creator.clone(),
            published_to: meta.published_to.clone(),
            relationships: meta.relationships.clone(),
            expires: meta.expires,
            cache_expires: meta.cache_expires,
        }
    }

    pub fn into_meta(self) -> PublicationMetaData {
        PublicationMetaData {
            name: self.name,
            mime_type: self.mime_type,
            encoding: self.encoding,
            version: self.version,
            base_version: self.base_version,
            lineage: self.lineage,
            creator: self.creator,
            published_to: self.published_to,
            relationships: self.relationships,
            expires: self.expires,
            cache_expires: self.cache_expires,
        }
    }
}

/// Publication payload as it travels inside a peer message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WirePayload {
    /// Base64-encoded binary data.
    Binary(String),

    /// Embedded JSON document. Interpreted as a diff run when the
    /// accompanying header carries a non-zero base version.
    Document(Document),
}

impl WirePayload {
    pub fn from_contents(contents: &Contents) -> Self {
        match contents {
            Contents::Binary(data) => {
                Self::Binary(base64::engine::general_purpose::STANDARD.encode(data))
            }
            Contents::Document(document) | Contents::Diffs { document, .. } => {
                Self::Document(document.clone())
            }
        }
    }

    /// Turns the wire form back into publication contents. `base_version`
    /// comes from the header and decides whether a document payload is a
    /// full copy or a diff run.
    pub fn into_contents(self, base_version: u64) -> Result<Contents, MessageError> {
        match self {
            Self::Binary(encoded) => {
                let data = base64::engine::general_purpose::STANDARD.decode(encoded)?;
                Ok(Contents::Binary(data))
            }
            Self::Document(document) if base_version == 0 => Ok(Contents::Document(document)),
            Self::Document(document) => Ok(Contents::Diffs {
                base_version,
                document,
            }),
        }
    }
}

/// Requests sent to a remote repository.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PeerRequest {
    /// Publish a publication into the receiver's local cache.
    Publish {
        header: PublicationHeader,
        payload: WirePayload,
    },

    /// Fetch a publication from the receiver. `header.version` carries the
    /// version the requester already holds, zero when it holds none, so the
    /// receiver can answer with a diff run instead of a full copy.
    Get { header: PublicationHeader },

    /// Remove a publication from the receiver's local cache. Only
    /// publications created by the requester match.
    Delete { header: PublicationHeader },

    /// Subscribe to publications whose name starts with `path`.
    Subscribe {
        path: String,
        relationships: Relationships,
    },

    /// Notification that a matching publication changed on the sender.
    /// Nobody replies to it. An attached payload lets the receiver update
    /// its cache without a round trip.
    PublishNotify {
        header: PublicationHeader,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<WirePayload>,
    },
}

/// Results replied to peer requests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PeerResult {
    /// Publish accepted. The header echoes the version the receiver now
    /// holds.
    Publish { header: PublicationHeader },

    /// Fetched publication contents.
    Get {
        header: PublicationHeader,
        payload: WirePayload,
    },

    /// Delete carried out.
    Delete { header: PublicationHeader },

    /// Subscription registered.
    Subscribe { path: String },

    /// Structured protocol failure.
    Error { code: u16, reason: String },
}

impl PeerResult {
    pub fn error(code: u16, reason: impl Into<String>) -> Self {
        Self::Error {
            code,
            reason: reason.into(),
        }
    }
}

impl PeerRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        // Requests only hold JSON-compatible values, encoding them never
        // fails.
        serde_json::to_vec(self).expect("peer request failed to serialize")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl PeerResult {
    pub fn to_bytes(&self) -> Vec<u8> {
        // See `PeerRequest::to_bytes`.
        serde_json::to_vec(self).expect("peer result failed to serialize")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}
