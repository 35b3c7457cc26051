//! Per-feed read/unread counters derived from the `entries` table.
//!
//! The aggregate groups by `(feed_id, status)`; rows are pivoted here into one
//! map per status. A feed missing from a map has a count of zero.
use std::collections::HashMap;

use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::types::{EntryStatus, StoreError};

/// Row selection shared by the feed listing query and its counter query.
///
/// Both queries derive their predicates and bind values from the same filter
/// so the counters always describe the same population as the feed rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FeedFilter {
    /// Every feed of a user
    User { user_id: i64 },
    /// A user's feeds in one category
    Category { user_id: i64, category_id: i64 },
    /// A single feed, still scoped by owner
    Feed { user_id: i64, feed_id: i64 },
}

impl FeedFilter {
    pub(crate) fn user_id(&self) -> i64 {
        match *self {
            FeedFilter::User { user_id }
            | FeedFilter::Category { user_id, .. }
            | FeedFilter::Feed { user_id, .. } => user_id,
        }
    }

    /// Push the predicate against the `feeds` table aliased as `f`.
    pub(crate) fn push_feed_predicate(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        builder.push("f.user_id = ");
        builder.push_bind(self.user_id());
        match *self {
            FeedFilter::User { .. } => {}
            FeedFilter::Category { category_id, .. } => {
                builder.push(" AND f.category_id = ");
                builder.push_bind(category_id);
            }
            FeedFilter::Feed { feed_id, .. } => {
                builder.push(" AND f.id = ");
                builder.push_bind(feed_id);
            }
        }
    }

    /// Push the predicate against `entries` aliased as `e`, joined to `f`.
    fn push_entry_predicate(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        builder.push("e.user_id = ");
        builder.push_bind(self.user_id());
        match *self {
            FeedFilter::User { .. } => {}
            FeedFilter::Category { category_id, .. } => {
                builder.push(" AND f.category_id = ");
                builder.push_bind(category_id);
            }
            FeedFilter::Feed { feed_id, .. } => {
                builder.push(" AND e.feed_id = ");
                builder.push_bind(feed_id);
            }
        }
    }
}

/// Read and unread entry counts keyed by feed ID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedCounters {
    pub read: HashMap<i64, i64>,
    pub unread: HashMap<i64, i64>,
}

impl FeedCounters {
    pub fn read(&self, feed_id: i64) -> i64 {
        self.read.get(&feed_id).copied().unwrap_or(0)
    }

    pub fn unread(&self, feed_id: i64) -> i64 {
        self.unread.get(&feed_id).copied().unwrap_or(0)
    }

    /// Pivot `(feed_id, status, count)` rows; statuses other than read and
    /// unread are skipped.
    fn from_rows(rows: impl IntoIterator<Item = (i64, String, i64)>) -> Self {
        let mut counters = Self::default();
        for (feed_id, status, count) in rows {
            if status == EntryStatus::Read.as_str() {
                counters.read.insert(feed_id, count);
            } else if status == EntryStatus::Unread.as_str() {
                counters.unread.insert(feed_id, count);
            }
        }
        counters
    }
}

/// Run the grouped counter query for `filter` on `conn`.
pub(crate) async fn fetch_feed_counters(
    conn: &mut SqliteConnection,
    filter: &FeedFilter,
) -> Result<FeedCounters, StoreError> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT e.feed_id, e.status, count(*) FROM entries e \
         JOIN feeds f ON f.id = e.feed_id WHERE ",
    );
    filter.push_entry_predicate(&mut builder);
    builder.push(" AND e.status IN (");
    builder.push_bind(EntryStatus::Read.as_str());
    builder.push(", ");
    builder.push_bind(EntryStatus::Unread.as_str());
    builder.push(") GROUP BY e.feed_id, e.status");

    let rows: Vec<(i64, String, i64)> = builder
        .build_query_as()
        .fetch_all(&mut *conn)
        .await
        .map_err(StoreError::query("unable to fetch feed counts"))?;

    Ok(FeedCounters::from_rows(rows))
}
