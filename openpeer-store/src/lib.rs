// SPDX-License-Identifier: MIT OR Apache-2.0

//! Key/expiry byte stores, used for parking idle publication documents and
//! for response caching elsewhere in the stack.
mod memory;
mod traits;

pub use memory::{MemoryCacheStore, current_timestamp};
pub use traits::CacheStore;
