use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Storage errors.
///
/// A single-row fetch that matches nothing is not an error: those operations
/// return `Ok(None)`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another process holds a lock on the database file
    #[error("store: the database is locked by another process")]
    Locked,

    /// Schema setup failed
    #[error("store: database migration failed: {0}")]
    Migration(String),

    /// Connection, execution or row decoding failure
    #[error("store: {context}: {source}")]
    Query {
        context: String,
        #[source]
        source: sqlx::Error,
    },

    /// A delete scoped by owner matched no row
    #[error("store: no feed has been removed (feed #{feed_id})")]
    NothingRemoved { feed_id: i64 },

    /// The user lacks the administrative flag
    #[error("store: user #{user_id} is not an administrator")]
    NotAdmin { user_id: i64 },
}

impl StoreError {
    /// Build a `map_err` adapter that attaches `context` to a sqlx error.
    pub(crate) fn query(context: impl Into<String>) -> impl FnOnce(sqlx::Error) -> Self {
        let context = context.into();
        move |source| StoreError::Query { context, source }
    }

    /// Classify a connection-time sqlx error, detecting lock contention.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
        {
            return StoreError::Locked;
        }

        StoreError::Query {
            context: "unable to open database".to_string(),
            source: err,
        }
    }
}

// ============================================================================
// Constants
// ============================================================================

/// A feed whose parsing error count reaches this value is reported as failing.
pub const MAX_PARSING_ERRORS: i64 = 3;

// ============================================================================
// Data Structures
// ============================================================================

/// Category as embedded in a [`Feed`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Category {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
}

/// Association between a feed and its stored icon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedIcon {
    pub feed_id: i64,
    pub icon_id: i64,
}

/// Read state of an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EntryStatus {
    #[default]
    Unread,
    Read,
    Removed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Unread => "unread",
            EntryStatus::Read => "read",
            EntryStatus::Removed => "removed",
        }
    }
}

/// A content item belonging to one feed and one user.
///
/// `hash` identifies the item within its feed; two entries with the same
/// hash for the same feed and user are the same entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: i64,
    pub user_id: i64,
    pub feed_id: i64,
    pub hash: String,
    pub title: String,
    pub url: String,
    pub author: String,
    pub content: String,
    pub status: EntryStatus,
    pub published_at: DateTime<Utc>,
}

impl Entry {
    /// New unread entry; `user_id` and `feed_id` are stamped on creation.
    pub fn new(
        hash: impl Into<String>,
        title: impl Into<String>,
        published_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            user_id: 0,
            feed_id: 0,
            hash: hash.into(),
            title: title.into(),
            url: String::new(),
            author: String::new(),
            content: String::new(),
            status: EntryStatus::Unread,
            published_at,
        }
    }
}

/// A subscribed feed with its crawling configuration and error state.
///
/// `checked_at` and `next_check_at` are expressed in the owning user's
/// timezone once loaded. `read_count` and `unread_count` are only filled by
/// the `*_with_counters` listings. `entries` holds items to insert on
/// [`Database::create_feed`](super::Database::create_feed) and is never
/// populated by reads.
#[derive(Clone, PartialEq)]
pub struct Feed {
    pub id: i64,
    pub user_id: i64,
    pub feed_url: String,
    pub site_url: String,
    pub title: String,
    pub category: Category,
    pub icon: Option<FeedIcon>,
    pub etag_header: String,
    pub last_modified_header: String,
    pub crawler: bool,
    pub user_agent: String,
    pub scraper_rules: String,
    pub rewrite_rules: String,
    pub username: String,
    pub password: String,
    pub ignore_http_cache: bool,
    pub fetch_via_proxy: bool,
    pub disabled: bool,
    pub checked_at: DateTime<Tz>,
    pub next_check_at: DateTime<Tz>,
    pub parsing_error_count: i64,
    pub parsing_error_msg: String,
    pub read_count: i64,
    pub unread_count: i64,
    pub entries: Vec<Entry>,
}

impl Feed {
    /// Unsaved feed for `user_id` in category `category_id`.
    pub fn new(user_id: i64, category_id: i64, feed_url: impl Into<String>) -> Self {
        let epoch = DateTime::<Utc>::default().with_timezone(&Tz::UTC);
        Self {
            id: 0,
            user_id,
            feed_url: feed_url.into(),
            site_url: String::new(),
            title: String::new(),
            category: Category {
                id: category_id,
                user_id,
                title: String::new(),
            },
            icon: None,
            etag_header: String::new(),
            last_modified_header: String::new(),
            crawler: false,
            user_agent: String::new(),
            scraper_rules: String::new(),
            rewrite_rules: String::new(),
            username: String::new(),
            password: String::new(),
            ignore_http_cache: false,
            fetch_via_proxy: false,
            disabled: false,
            checked_at: epoch,
            next_check_at: epoch,
            parsing_error_count: 0,
            parsing_error_msg: String::new(),
            read_count: 0,
            unread_count: 0,
            entries: Vec::new(),
        }
    }

    /// True once the parsing error count reaches [`MAX_PARSING_ERRORS`].
    pub fn has_errors(&self) -> bool {
        self.parsing_error_count >= MAX_PARSING_ERRORS
    }
}

/// Masks `password` so credentials never reach logs.
impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("feed_url", &self.feed_url)
            .field("site_url", &self.site_url)
            .field("title", &self.title)
            .field("category", &self.category)
            .field("icon", &self.icon)
            .field("etag_header", &self.etag_header)
            .field("last_modified_header", &self.last_modified_header)
            .field("crawler", &self.crawler)
            .field("user_agent", &self.user_agent)
            .field("scraper_rules", &self.scraper_rules)
            .field("rewrite_rules", &self.rewrite_rules)
            .field("username", &self.username)
            .field(
                "password",
                &(!self.password.is_empty()).then_some("[REDACTED]"),
            )
            .field("ignore_http_cache", &self.ignore_http_cache)
            .field("fetch_via_proxy", &self.fetch_via_proxy)
            .field("disabled", &self.disabled)
            .field("checked_at", &self.checked_at)
            .field("next_check_at", &self.next_check_at)
            .field("parsing_error_count", &self.parsing_error_count)
            .field("parsing_error_msg", &self.parsing_error_msg)
            .field("read_count", &self.read_count)
            .field("unread_count", &self.unread_count)
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Global feed population split by the `disabled` flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedCountSummary {
    pub enabled: i64,
    pub disabled: i64,
    pub total: i64,
}

/// Capability required by process-wide administrative operations.
///
/// Only [`Database::admin_access`](super::Database::admin_access) can
/// construct one, after checking the user's administrator flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminAccess {
    user_id: i64,
}

impl AdminAccess {
    pub(crate) fn new(user_id: i64) -> Self {
        Self { user_id }
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }
}

// ============================================================================
// Helper Types
// ============================================================================

/// Row shape shared by every feed query (see `FEED_QUERY`).
#[derive(sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub feed_url: String,
    pub site_url: String,
    pub title: String,
    pub etag_header: String,
    pub last_modified_header: String,
    pub user_id: i64,
    pub checked_at: i64,
    pub next_check_at: i64,
    pub parsing_error_count: i64,
    pub parsing_error_msg: String,
    pub scraper_rules: String,
    pub rewrite_rules: String,
    pub crawler: bool,
    pub user_agent: String,
    pub username: String,
    pub password: String,
    pub ignore_http_cache: bool,
    pub fetch_via_proxy: bool,
    pub disabled: bool,
    pub category_id: i64,
    pub category_title: Option<String>,
    pub icon_id: Option<i64>,
    pub timezone: Option<String>,
}

impl FeedDbRow {
    /// Convert a row into a [`Feed`], localizing timestamps to the row's own
    /// user timezone.
    pub(crate) fn into_feed(self) -> Feed {
        let tz = self.timezone.as_deref().unwrap_or("UTC");
        let icon = self.icon_id.map(|icon_id| FeedIcon {
            feed_id: self.id,
            icon_id,
        });

        Feed {
            id: self.id,
            user_id: self.user_id,
            feed_url: self.feed_url,
            site_url: self.site_url,
            title: self.title,
            category: Category {
                id: self.category_id,
                user_id: self.user_id,
                title: self.category_title.unwrap_or_default(),
            },
            icon,
            etag_header: self.etag_header,
            last_modified_header: self.last_modified_header,
            crawler: self.crawler,
            user_agent: self.user_agent,
            scraper_rules: self.scraper_rules,
            rewrite_rules: self.rewrite_rules,
            username: self.username,
            password: self.password,
            ignore_http_cache: self.ignore_http_cache,
            fetch_via_proxy: self.fetch_via_proxy,
            disabled: self.disabled,
            checked_at: crate::timezone::from_unix(tz, self.checked_at),
            next_check_at: crate::timezone::from_unix(tz, self.next_check_at),
            parsing_error_count: self.parsing_error_count,
            parsing_error_msg: self.parsing_error_msg,
            read_count: 0,
            unread_count: 0,
            entries: Vec::new(),
        }
    }
}
