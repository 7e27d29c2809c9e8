use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use postsync_core::{decode_posts, Post, Record, SyncError, UpsertOutcome, UpsertSummary};
use postsync_store_sqlite::{is_constraint_violation, RecordSession, SqliteStore};
use tracing::{info, warn};

pub const UPSTREAM_POSTS_URL: &str = "https://jsonplaceholder.typicode.com/posts";

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Supplier of the post listing that `fetch_and_store` reconciles against the store.
pub trait PostSource: Send + Sync {
    /// # Errors
    /// Returns [`SyncError::Upstream`] or [`SyncError::Decode`] when the listing
    /// cannot be obtained.
    fn fetch_posts(&self) -> Result<Vec<Post>, SyncError>;
}

impl<F> PostSource for F
where
    F: Fn() -> Result<Vec<Post>, SyncError> + Send + Sync,
{
    fn fetch_posts(&self) -> Result<Vec<Post>, SyncError> {
        self()
    }
}

/// Blocking HTTP source for a JSON post listing.
pub struct HttpPostSource {
    url: String,
    agent: ureq::Agent,
}

impl HttpPostSource {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(UPSTREAM_TIMEOUT).build();
        Self { url: url.into(), agent }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Default for HttpPostSource {
    fn default() -> Self {
        Self::new(UPSTREAM_POSTS_URL)
    }
}

impl PostSource for HttpPostSource {
    fn fetch_posts(&self) -> Result<Vec<Post>, SyncError> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .map_err(|err| SyncError::Upstream(format!("GET {} failed: {err}", self.url)))?;
        let raw = response.into_string().map_err(|err| {
            SyncError::Upstream(format!("failed to read response body from {}: {err}", self.url))
        })?;
        decode_posts(&raw)
    }
}

#[derive(Clone)]
pub struct PostSyncApi {
    db_path: PathBuf,
    source: Arc<dyn PostSource>,
}

impl Debug for PostSyncApi {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostSyncApi").field("db_path", &self.db_path).finish_non_exhaustive()
    }
}

impl PostSyncApi {
    /// API over `db_path` that reads posts from the fixed upstream URL.
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self::with_source(db_path, Arc::new(HttpPostSource::default()))
    }

    #[must_use]
    pub fn with_source(db_path: PathBuf, source: Arc<dyn PostSource>) -> Self {
        Self { db_path, source }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Create the record schema if it does not exist yet.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or the schema cannot be created.
    pub fn initialize(&self) -> Result<()> {
        let store = self.open_store()?;
        store.initialize()
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or read.
    pub fn list_records(&self) -> Result<Vec<Record>> {
        let store = self.open_store()?;
        store.list_records()
    }

    /// Fetch the upstream listing and upsert every post by title in one transaction.
    ///
    /// Blocks on network and disk I/O; async callers should run it on a blocking thread.
    #[must_use]
    pub fn fetch_and_store(&self) -> UpsertOutcome {
        let result = self.source.fetch_posts().and_then(|posts| {
            info!(posts = posts.len(), "fetched upstream posts");
            self.store_posts(&posts)
        });
        let outcome = UpsertOutcome::from(result);

        match &outcome {
            UpsertOutcome::Success(summary) => info!(
                inserted = summary.inserted,
                updated = summary.updated,
                "stored upstream posts"
            ),
            UpsertOutcome::ConstraintViolation { detail } => {
                warn!(%detail, "constraint violation while storing posts; transaction rolled back");
            }
            UpsertOutcome::OtherError { detail } => warn!(%detail, "fetch and store failed"),
        }

        outcome
    }

    /// Upsert `posts` in input order: an existing title gets its body replaced,
    /// an unknown title is inserted. All or nothing.
    ///
    /// # Errors
    /// Returns [`SyncError::ConstraintViolation`] when `SQLite` rejects a write on a
    /// constraint, and [`SyncError::Storage`] for any other database failure.
    pub fn store_posts(&self, posts: &[Post]) -> Result<UpsertSummary, SyncError> {
        let mut store = self.open_store().map_err(classify_storage_error)?;
        let session = store.session().map_err(classify_storage_error)?;

        match apply_posts(&session, posts) {
            Ok(summary) => {
                session.commit().map_err(classify_storage_error)?;
                Ok(summary)
            }
            Err(err) => {
                if let Err(rollback_err) = session.rollback() {
                    warn!(error = %format!("{rollback_err:#}"), "rollback failed");
                }
                Err(classify_storage_error(err))
            }
        }
    }
}

fn apply_posts(session: &RecordSession<'_>, posts: &[Post]) -> Result<UpsertSummary> {
    let mut summary = UpsertSummary::default();
    for post in posts {
        if let Some(existing) = session.find_by_title(&post.title)? {
            session.update_body(existing.id, &post.body)?;
            summary.updated += 1;
        } else {
            session.insert(&post.title, &post.body)?;
            summary.inserted += 1;
        }
    }
    Ok(summary)
}

fn classify_storage_error(err: anyhow::Error) -> SyncError {
    if is_constraint_violation(&err) {
        SyncError::ConstraintViolation(format!("{err:#}"))
    } else {
        SyncError::Storage(format!("{err:#}"))
    }
}
