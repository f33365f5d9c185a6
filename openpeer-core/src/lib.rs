// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core data-types of the openpeer publication stack: structured documents,
//! diff application and merging, publication identity metadata and the
//! versioned publication itself.

pub mod diff;
pub mod document;
pub mod lineage;
pub mod location;
pub mod metadata;
pub mod publication;

pub use document::{Document, DocumentError};
pub use lineage::LineageAllocator;
pub use location::{ConnectionState, Location, PeerUri};
pub use metadata::{
    Encoding, Permission, PublicationKey, PublicationMetaData, RelationshipEntry, Relationships,
};
pub use publication::{Contents, Publication, PublicationError};
