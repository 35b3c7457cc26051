mod categories;
mod counters;
mod entries;
mod feeds;
mod icons;
mod schema;
mod types;
mod users;

pub use counters::FeedCounters;
pub use schema::Database;
pub use types::{
    AdminAccess, Category, Entry, EntryStatus, Feed, FeedCountSummary, FeedIcon, StoreError,
    MAX_PARSING_ERRORS,
};
