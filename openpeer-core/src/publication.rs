// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use openpeer_store::CacheStore;
use thiserror::Error;

use crate::diff::{self, DiffError};
use crate::document::{Document, DocumentError};
use crate::lineage::LineageAllocator;
use crate::location::{Location, PeerUri};
use crate::metadata::{Encoding, PublicationKey, PublicationMetaData, Relationships};

/// Structured document plus the bookkeeping for parking it in an external
/// cache store while idle.
#[derive(Clone, Debug)]
struct DocumentSlot {
    document: Option<Document>,
    cache_key: Option<String>,
    last_access: Instant,
}

impl DocumentSlot {
    fn new(document: Document) -> Self {
        Self {
            document: Some(document),
            cache_key: None,
            last_access: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_access = Instant::now();
    }
}

#[derive(Clone, Debug)]
enum Payload {
    Binary(Vec<u8>),
    Document(DocumentSlot),
}

/// Publication payload prepared for transfer: raw binary data, the whole
/// structured document or a merged diff run.
#[derive(Clone, Debug, PartialEq)]
pub enum Contents {
    Binary(Vec<u8>),
    Document(Document),
    Diffs { base_version: u64, document: Document },
}

impl Contents {
    /// First version of the diff run, 0 for whole-payload contents.
    pub fn base_version(&self) -> u64 {
        match self {
            Self::Diffs { base_version, .. } => *base_version,
            _ => 0,
        }
    }

    pub fn is_diff(&self) -> bool {
        matches!(self, Self::Diffs { .. })
    }

    pub fn size(&self) -> usize {
        match self {
            Self::Binary(data) => data.len(),
            Self::Document(document) => document.size(),
            Self::Diffs { document, .. } => document.size(),
        }
    }
}

/// A versioned publication: identity metadata plus payload plus the chain of
/// diffs that produced the current version.
///
/// The diff chain maps version numbers to the exact update document that
/// produced that version. It is only ever trusted as a contiguous run; any
/// gap forces whole-document transfers until the chain regrows.
#[derive(Clone, Debug)]
pub struct Publication {
    meta: PublicationMetaData,
    payload: Payload,
    diffs: BTreeMap<u64, Document>,
}

impl Publication {
    /// Creates a binary publication at version 1 under a fresh lineage.
    pub fn from_bytes(
        lineage: &LineageAllocator,
        creator: Location,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: Vec<u8>,
        relationships: Relationships,
        published_to: Location,
    ) -> Self {
        Self {
            meta: Self::initial_meta(
                lineage,
                creator,
                name.into(),
                mime_type.into(),
                Encoding::Binary,
                relationships,
                published_to,
            ),
            payload: Payload::Binary(data),
            diffs: BTreeMap::new(),
        }
    }

    /// Creates a structured publication at version 1 under a fresh lineage.
    pub fn from_document(
        lineage: &LineageAllocator,
        creator: Location,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        document: Document,
        relationships: Relationships,
        published_to: Location,
    ) -> Self {
        Self {
            meta: Self::initial_meta(
                lineage,
                creator,
                name.into(),
                mime_type.into(),
                Encoding::Json,
                relationships,
                published_to,
            ),
            payload: Payload::Document(DocumentSlot::new(document)),
            diffs: BTreeMap::new(),
        }
    }

    /// Creates a relationship-document publication from a contact list.
    pub fn from_contact_list<'a>(
        lineage: &LineageAllocator,
        creator: Location,
        name: impl Into<String>,
        contacts: impl IntoIterator<Item = &'a PeerUri>,
        relationships: Relationships,
        published_to: Location,
    ) -> Self {
        Self::from_document(
            lineage,
            creator,
            name,
            "text/json",
            Document::from_contact_list(contacts),
            relationships,
            published_to,
        )
    }

    /// Reconstructs a publication from decoded wire data.
    ///
    /// The metadata carries the remote version and lineage as-is; the
    /// contents decide the payload form, with a diff run recording its base
    /// version in the metadata.
    pub fn from_wire(mut meta: PublicationMetaData, contents: Contents) -> Self {
        let payload = match contents {
            Contents::Binary(data) => {
                meta.encoding = Encoding::Binary;
                meta.base_version = 0;
                Payload::Binary(data)
            }
            Contents::Document(document) => {
                meta.encoding = Encoding::Json;
                meta.base_version = 0;
                Payload::Document(DocumentSlot::new(document))
            }
            Contents::Diffs {
                base_version,
                document,
            } => {
                meta.encoding = Encoding::Json;
                meta.base_version = base_version;
                Payload::Document(DocumentSlot::new(document))
            }
        };

        Self {
            meta,
            payload,
            diffs: BTreeMap::new(),
        }
    }

    fn initial_meta(
        lineage: &LineageAllocator,
        creator: Location,
        name: String,
        mime_type: String,
        encoding: Encoding,
        relationships: Relationships,
        published_to: Location,
    ) -> PublicationMetaData {
        PublicationMetaData {
            name,
            mime_type,
            encoding,
            version: 1,
            base_version: 0,
            lineage: lineage.next(),
            creator,
            published_to,
            relationships,
            expires: None,
            cache_expires: None,
        }
    }

    pub fn meta(&self) -> &PublicationMetaData {
        &self.meta
    }

    pub fn key(&self) -> PublicationKey {
        self.meta.key()
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn version(&self) -> u64 {
        self.meta.version
    }

    pub fn base_version(&self) -> u64 {
        self.meta.base_version
    }

    pub fn lineage(&self) -> u64 {
        self.meta.lineage
    }

    pub fn encoding(&self) -> Encoding {
        self.meta.encoding
    }

    pub fn creator(&self) -> &Location {
        &self.meta.creator
    }

    pub fn published_to(&self) -> &Location {
        &self.meta.published_to
    }

    pub fn is_matching(&self, other: &PublicationMetaData, ignore_lineage: bool) -> bool {
        self.meta.is_matching(other, ignore_lineage)
    }

    pub fn set_expires(&mut self, expires: Option<u64>) {
        self.meta.expires = expires;
    }

    pub fn set_cache_expires(&mut self, cache_expires: Option<u64>) {
        self.meta.cache_expires = cache_expires;
    }

    /// Records the version the published location has acknowledged, so the
    /// next publish can send only the diffs on top of it.
    pub fn set_base_version(&mut self, base_version: u64) {
        self.meta.base_version = base_version;
    }

    /// Raw binary payload, when this is a binary publication.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Binary(data) => Some(data),
            Payload::Document(_) => None,
        }
    }

    /// The structured document of this publication.
    ///
    /// Counts as an access for idle-eviction purposes. Fails when the
    /// payload is binary or the document is currently parked in the cache
    /// store (restore it first with [`Publication::ensure_document`]).
    pub fn document(&mut self) -> Result<&Document, PublicationError> {
        match &mut self.payload {
            Payload::Binary(_) => Err(PublicationError::NotADocument),
            Payload::Document(slot) => {
                slot.touch();
                slot.document
                    .as_ref()
                    .ok_or(PublicationError::DocumentEvicted)
            }
        }
    }

    pub fn is_document_evicted(&self) -> bool {
        matches!(&self.payload, Payload::Document(slot) if slot.document.is_none())
    }

    /// True when the payload is a diff run rather than a whole copy.
    pub fn carries_diff(&self) -> bool {
        self.meta.base_version != 0
            && matches!(
                &self.payload,
                Payload::Document(slot)
                    if slot.document.as_ref().is_some_and(diff::is_diff_document)
            )
    }

    /// Replaces the payload with new binary data.
    ///
    /// Binary data cannot be diffed, so any structured-document and
    /// diff-chain state is discarded.
    pub fn update_bytes(&mut self, data: Vec<u8>) {
        self.meta.version += 1;
        self.meta.encoding = Encoding::Binary;
        self.payload = Payload::Binary(data);
        self.diffs.clear();
    }

    /// Applies an update document.
    ///
    /// Updates without the diff marker replace the whole document and clear
    /// the chain. Updates with the marker apply against the current document
    /// and are retained verbatim as the diff for the new version; a malformed
    /// diff degrades to a whole-document replace.
    pub fn update_document(&mut self, update: Document) -> Result<(), PublicationError> {
        if !diff::is_diff_document(&update) {
            self.replace_document(update);
            return Ok(());
        }

        // The diff that produced the current version must itself be chained,
        // otherwise the chain has a gap and cannot be trusted.
        if !self.diffs.contains_key(&self.meta.version) {
            self.diffs.clear();
        }

        let current = match &self.payload {
            Payload::Document(slot) => match &slot.document {
                Some(document) => document.clone(),
                None => return Err(PublicationError::DocumentEvicted),
            },
            // A diff cannot apply against binary data.
            Payload::Binary(_) => {
                self.replace_document(update);
                return Ok(());
            }
        };

        let mut next = current;
        match diff::apply(&mut next, &update) {
            Ok(()) => {
                self.meta.version += 1;
                self.meta.encoding = Encoding::Json;
                if let Payload::Document(slot) = &mut self.payload {
                    slot.document = Some(next);
                    slot.touch();
                }
                self.diffs.insert(self.meta.version, update);
            }
            Err(_) => {
                self.replace_document(update);
            }
        }

        Ok(())
    }

    fn replace_document(&mut self, document: Document) {
        self.meta.version += 1;
        self.meta.encoding = Encoding::Json;
        self.payload = Payload::Document(DocumentSlot::new(document));
        self.diffs.clear();
    }

    /// Merges a fetched copy of this publication into the local state.
    ///
    /// A whole copy replaces the local payload outright. A diff run requires
    /// `base_version == local version + 1`; on mismatch nothing changes and
    /// the caller falls back to fetching the whole document. On success the
    /// fetched identity fields become authoritative, the chain clears and
    /// `base_version` resets to 0: the local state is self-consistent again.
    pub fn update_from_fetched(&mut self, fetched: &Publication) -> Result<(), PublicationError> {
        match &fetched.payload {
            Payload::Document(slot) => {
                let fetched_document = slot
                    .document
                    .as_ref()
                    .ok_or(PublicationError::DocumentEvicted)?;

                if fetched.meta.base_version != 0 && diff::is_diff_document(fetched_document) {
                    // Versions are only comparable within one lineage; a diff
                    // from another publish epoch can never line up.
                    let expected = self.meta.version + 1;
                    if fetched.meta.lineage != self.meta.lineage
                        || fetched.meta.base_version != expected
                    {
                        return Err(PublicationError::VersionMismatch {
                            expected,
                            got: fetched.meta.base_version,
                        });
                    }

                    let mut next = match &self.payload {
                        Payload::Document(slot) => slot
                            .document
                            .clone()
                            .ok_or(PublicationError::DocumentEvicted)?,
                        // A diff cannot merge into binary data, only a whole
                        // copy can. Signalled as a mismatch so the caller
                        // re-fetches in full.
                        Payload::Binary(_) => {
                            return Err(PublicationError::VersionMismatch {
                                expected,
                                got: fetched.meta.base_version,
                            });
                        }
                    };
                    diff::apply(&mut next, fetched_document)?;
                    self.payload = Payload::Document(DocumentSlot::new(next));
                } else {
                    self.payload =
                        Payload::Document(DocumentSlot::new(fetched_document.clone()));
                }
            }
            Payload::Binary(data) => {
                self.payload = Payload::Binary(data.clone());
            }
        }

        self.meta.creator = fetched.meta.creator.clone();
        self.meta.mime_type = fetched.meta.mime_type.clone();
        self.meta.encoding = fetched.meta.encoding;
        self.meta.version = fetched.meta.version;
        self.meta.lineage = fetched.meta.lineage;
        self.meta.published_to = fetched.meta.published_to.clone();
        self.meta.relationships = fetched.meta.relationships.clone();
        self.meta.expires = fetched.meta.expires;
        self.meta.cache_expires = fetched.meta.cache_expires;
        self.meta.base_version = 0;
        self.diffs.clear();

        Ok(())
    }

    /// Contents covering `from_version..=to_version`.
    ///
    /// Returns the merged diff run when every version in the span is
    /// chained. Version 0, a gap in the chain or corruption while merging
    /// all force whole-payload contents instead; a diff run is never
    /// partially spliced.
    pub fn contents(
        &mut self,
        from_version: u64,
        to_version: u64,
    ) -> Result<Contents, PublicationError> {
        match &mut self.payload {
            Payload::Binary(data) => Ok(Contents::Binary(data.clone())),
            Payload::Document(slot) => {
                slot.touch();

                let contiguous = from_version >= 1
                    && from_version <= to_version
                    && (from_version..=to_version).all(|version| self.diffs.contains_key(&version));

                if contiguous {
                    let run = (from_version..=to_version)
                        .filter_map(|version| self.diffs.get(&version));
                    if let Ok(document) = diff::merge(run) {
                        return Ok(Contents::Diffs {
                            base_version: from_version,
                            document,
                        });
                    }
                }

                let document = slot
                    .document
                    .as_ref()
                    .ok_or(PublicationError::DocumentEvicted)?;
                Ok(Contents::Document(document.clone()))
            }
        }
    }

    /// Contents to send when publishing to the published location: the diffs
    /// on top of the acknowledged base version when the chain allows it, the
    /// whole payload otherwise.
    pub fn publish_contents(&mut self) -> Result<Contents, PublicationError> {
        let from_version = if self.meta.base_version == 0 {
            0
        } else {
            self.meta.base_version + 1
        };
        self.contents(from_version, self.meta.version)
    }

    /// Payload size estimation.
    pub fn size(&self) -> usize {
        match &self.payload {
            Payload::Binary(data) => data.len(),
            Payload::Document(slot) => slot.document.as_ref().map(Document::size).unwrap_or(0),
        }
    }

    /// Transfer size estimation for [`Publication::contents`].
    pub fn contents_size(
        &mut self,
        from_version: u64,
        to_version: u64,
    ) -> Result<usize, PublicationError> {
        Ok(self.contents(from_version, to_version)?.size())
    }

    /// How long the in-memory document has been idle, when there is one.
    pub fn idle_duration(&self) -> Option<Duration> {
        match &self.payload {
            Payload::Document(slot) if slot.document.is_some() => Some(slot.last_access.elapsed()),
            _ => None,
        }
    }

    /// Serializes the document into the cache store and releases it from
    /// memory. Binary payloads and already-parked documents are left alone.
    pub async fn evict_document<S: CacheStore>(
        &mut self,
        key: &str,
        store: &S,
    ) -> Result<(), PublicationError> {
        let expires = self.meta.effective_expiry();
        let Payload::Document(slot) = &mut self.payload else {
            return Ok(());
        };
        let Some(document) = &slot.document else {
            return Ok(());
        };

        store
            .store(key, expires, document.to_bytes())
            .await
            .map_err(store_error)?;
        slot.cache_key = Some(key.to_string());
        slot.document = None;

        Ok(())
    }

    /// Restores a parked document from the cache store. A no-op when the
    /// document is in memory; counts as an access either way.
    pub async fn ensure_document<S: CacheStore>(
        &mut self,
        store: &S,
    ) -> Result<(), PublicationError> {
        let Payload::Document(slot) = &mut self.payload else {
            return Ok(());
        };
        if slot.document.is_some() {
            slot.touch();
            return Ok(());
        }

        let key = slot.cache_key.as_ref().ok_or(PublicationError::DocumentGone)?;
        let bytes = store
            .fetch(key)
            .await
            .map_err(store_error)?
            .ok_or(PublicationError::DocumentGone)?;
        slot.document = Some(Document::from_bytes(&bytes)?);
        slot.touch();

        Ok(())
    }
}

fn store_error(err: impl std::error::Error) -> PublicationError {
    PublicationError::Store(err.to_string())
}

#[derive(Error, Debug)]
pub enum PublicationError {
    #[error("publication carries binary data, not a structured document")]
    NotADocument,

    #[error("version mismatch: expected base version {expected}, got {got}")]
    VersionMismatch { expected: u64, got: u64 },

    #[error("publication document is parked in the cache store")]
    DocumentEvicted,

    #[error("publication document is gone from the cache store")]
    DocumentGone,

    #[error("invalid document: {0}")]
    Document(#[from] DocumentError),

    #[error("invalid diff: {0}")]
    Diff(#[from] DiffError),

    #[error("cache store failed: {0}")]
    Store(String),
}
