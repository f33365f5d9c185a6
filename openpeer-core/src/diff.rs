// SPDX-License-Identifier: MIT OR Apache-2.0

//! Applies and merges diff documents.
//!
//! A diff document is a regular [`Document`] carrying the well-known diff
//! marker: a top-level `"diffs"` member holding an `"item"` array, where each
//! item describes one change against the base document. A diff is always the
//! exact update document a caller supplied, retained verbatim; it is never a
//! computed minimal delta.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::document::Document;

/// Top-level member marking a document as a diff rather than a full
/// replacement.
pub const DIFF_ROOT_KEY: &str = "diffs";

/// Member inside the diff root holding the list of change items.
pub const DIFF_ITEM_KEY: &str = "item";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffOp {
    /// Insert or overwrite a member, creating intermediate objects on the
    /// way.
    Set,
    /// Overwrite a member which must already exist.
    Replace,
    /// Delete a member which must already exist.
    Remove,
}

/// One change against a base document.
///
/// `path` addresses nested object members, `/`-separated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiffItem {
    pub op: DiffOp,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl DiffItem {
    pub fn set(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: DiffOp::Set,
            path: path.into(),
            value: Some(value),
        }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: DiffOp::Replace,
            path: path.into(),
            value: Some(value),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: DiffOp::Remove,
            path: path.into(),
            value: None,
        }
    }
}

/// True when the document carries the diff marker.
pub fn is_diff_document(document: &Document) -> bool {
    document.contains_key(DIFF_ROOT_KEY)
}

/// Builds a diff document from a list of change items.
pub fn diff_document(items: impl IntoIterator<Item = DiffItem>) -> Document {
    let entries: Vec<Value> = items
        .into_iter()
        // DiffItem is a plain struct of JSON-native fields.
        .map(|item| serde_json::to_value(item).expect("diff item failed to serialize"))
        .collect();

    let mut root = Map::new();
    root.insert(DIFF_ITEM_KEY.to_string(), Value::Array(entries));
    let mut map = Map::new();
    map.insert(DIFF_ROOT_KEY.to_string(), Value::Object(root));

    // The map shape is constructed above, it is always a valid document.
    Document::from_value(Value::Object(map)).expect("diff document is an object")
}

/// Parses and validates the change items of a diff document.
pub fn items(document: &Document) -> Result<Vec<DiffItem>, DiffError> {
    let entries = raw_items(document)?;

    let mut items = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let item: DiffItem = serde_json::from_value(entry.clone())
            .map_err(|_| DiffError::MalformedItem(index))?;
        validate_item(&item, index)?;
        items.push(item);
    }

    Ok(items)
}

/// Applies a diff document to a base document, in place.
///
/// A failing apply leaves the base untouched; a corrupt diff never gets
/// partially applied.
pub fn apply(base: &mut Document, diff: &Document) -> Result<(), DiffError> {
    let items = items(diff)?;

    let mut work = base.clone();
    for item in &items {
        apply_item(work.as_map_mut(), item)?;
    }

    *base = work;
    Ok(())
}

/// Merges a run of diff documents into a single diff document.
///
/// The first document is cloned wholesale and the change items of every
/// subsequent document are spliced into its item array, preserving order.
/// Corruption anywhere in the run aborts the merge; callers fall back to
/// sending the whole document instead.
pub fn merge<'a>(diffs: impl IntoIterator<Item = &'a Document>) -> Result<Document, DiffError> {
    let mut run = diffs.into_iter();
    let first = run.next().ok_or(DiffError::EmptyRun)?;

    // Validate before splicing so a corrupt later diff never yields partial
    // output.
    items(first)?;
    let mut merged = first.clone();

    for later in run {
        items(later)?;
        let additions = raw_items(later)?.clone();

        let entries = merged
            .as_map_mut()
            .get_mut(DIFF_ROOT_KEY)
            .and_then(|root| root.as_object_mut())
            .and_then(|root| root.get_mut(DIFF_ITEM_KEY))
            .and_then(|items| items.as_array_mut())
            .ok_or(DiffError::MalformedItems)?;
        entries.extend(additions);
    }

    Ok(merged)
}

fn raw_items(document: &Document) -> Result<&Vec<Value>, DiffError> {
    let root = document.get(DIFF_ROOT_KEY).ok_or(DiffError::NotADiff)?;
    root.as_object()
        .and_then(|root| root.get(DIFF_ITEM_KEY))
        .and_then(|items| items.as_array())
        .ok_or(DiffError::MalformedItems)
}

fn validate_item(item: &DiffItem, index: usize) -> Result<(), DiffError> {
    if item.path.is_empty() || item.path.split('/').any(|segment| segment.is_empty()) {
        return Err(DiffError::MalformedItem(index));
    }
    match item.op {
        DiffOp::Set | DiffOp::Replace if item.value.is_none() => {
            Err(DiffError::MalformedItem(index))
        }
        DiffOp::Remove if item.value.is_some() => Err(DiffError::MalformedItem(index)),
        _ => Ok(()),
    }
}

fn apply_item(map: &mut Map<String, Value>, item: &DiffItem) -> Result<(), DiffError> {
    let segments: Vec<&str> = item.path.split('/').collect();
    let (leaf, parents) = segments.split_last().ok_or_else(|| {
        // Validation rejects empty paths already.
        DiffError::InvalidPath(item.path.clone())
    })?;

    let mut current = map;
    for parent in parents {
        match item.op {
            DiffOp::Set => {
                let entry = current
                    .entry(parent.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                current = entry
                    .as_object_mut()
                    .ok_or_else(|| DiffError::InvalidPath(item.path.clone()))?;
            }
            DiffOp::Replace | DiffOp::Remove => {
                current = current
                    .get_mut(*parent)
                    .ok_or_else(|| DiffError::MissingPath(item.path.clone()))?
                    .as_object_mut()
                    .ok_or_else(|| DiffError::InvalidPath(item.path.clone()))?;
            }
        }
    }

    match item.op {
        DiffOp::Set => {
            let value = item
                .value
                .clone()
                .ok_or_else(|| DiffError::InvalidPath(item.path.clone()))?;
            current.insert(leaf.to_string(), value);
        }
        DiffOp::Replace => {
            let value = item
                .value
                .clone()
                .ok_or_else(|| DiffError::InvalidPath(item.path.clone()))?;
            let target = current
                .get_mut(*leaf)
                .ok_or_else(|| DiffError::MissingPath(item.path.clone()))?;
            *target = value;
        }
        DiffOp::Remove => {
            current
                .remove(*leaf)
                .ok_or_else(|| DiffError::MissingPath(item.path.clone()))?;
        }
    }

    Ok(())
}

#[derive(Error, Debug, PartialEq)]
pub enum DiffError {
    #[error("document does not carry the diff marker")]
    NotADiff,

    #[error("diff item list is malformed")]
    MalformedItems,

    #[error("diff item {0} is malformed")]
    MalformedItem(usize),

    #[error("no diff documents in merge run")]
    EmptyRun,

    #[error("path {0:?} does not exist in base document")]
    MissingPath(String),

    #[error("path {0:?} does not address an object member")]
    InvalidPath(String),
}
