// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for publication repositories.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default interval between housekeeping sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default grace window granted to cached data from a peer which disconnected.
pub const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_secs(60 * 60 * 2);

/// Default idle duration after which a cached document body is moved into the
/// backing cache store.
pub const DEFAULT_DOCUMENT_IDLE: Duration = Duration::from_secs(60 * 5);

/// Default capacity of the repository actor inbox.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Configuration parameters for a local publication repository.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Interval of the periodic housekeeping sweep which drops expired cached
    /// publications and parks idle document bodies.
    pub sweep_interval: Duration,

    /// Grace window applied to publications cached from a remote peer when
    /// that peer disconnects. The data stays available until the window
    /// passes, so a quick reconnect loses nothing.
    pub disconnect_grace: Duration,

    /// Idle duration after which a cached document body is serialised into
    /// the cache store and dropped from memory.
    pub document_idle: Duration,

    /// Capacity of the actor inbox and of subscription event channels.
    pub channel_capacity: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
            document_idle: DEFAULT_DOCUMENT_IDLE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}
