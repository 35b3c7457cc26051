//! Feed repository for a multi-user content aggregator.
//!
//! The [`storage::Database`] handle persists feeds, resolves their category,
//! icon and owner timezone, and merges per-feed read/unread counters computed
//! from the `entries` table.
pub mod config;
pub mod storage;
pub mod timezone;
