// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;

/// Byte store with per-entry expiry.
///
/// Backs the idle-document eviction of publications; outside this workspace
/// the same interface caches service-discovery responses. Keys are opaque
/// strings, expiry timestamps are UNIX epoch seconds, an unset expiry keeps
/// the entry until it is removed.
///
/// Reads and writes are expected to be fast local IO; callers hold their own
/// state across these awaits.
pub trait CacheStore {
    type Error: Error;

    /// Stores bytes under a key, replacing any previous entry.
    fn store(
        &self,
        key: &str,
        expires: Option<u64>,
        bytes: Vec<u8>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Fetches the bytes stored under a key.
    ///
    /// Entries past their expiry read as absent.
    fn fetch(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;

    /// Removes the entry under a key, if any.
    fn remove(&self, key: &str) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Drops every entry past its expiry.
    fn prune(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
