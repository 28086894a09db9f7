//! Row access for the `banner` and `feature_tag_banner` tables.
//!
//! Every query is exposed through [`BannerQueries`], which is implemented both by a
//! standalone connection and by an open transaction, so callers decide whether a step
//! runs on its own or as part of a larger unit of work. This layer never caches and
//! never retries: failures come back as [`StoreError`] for the services to interpret.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryStore, StoreOp};
pub use postgres::PgStore;

/// Postgres SQLSTATE for unique_violation.
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(ref db_error)
                if db_error.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                StoreError::UniqueViolation(
                    db_error
                        .constraint()
                        .unwrap_or("feature_tag_banner_feature_id_tag_id_key")
                        .to_owned(),
                )
            }
            other => StoreError::Database(other),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A banner row exactly as persisted. `content` is kept as the raw JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BannerRow {
    pub id: i64,
    pub content: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One (feature, tag) -> banner mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::FromRow)]
pub struct Assignment {
    pub banner_id: i64,
    pub feature_id: i64,
    pub tag_id: i64,
}

/// Filter used by the admin listing. `None` on either side matches everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssignmentFilter {
    pub feature_id: Option<i64>,
    pub tag_id: Option<i64>,
    pub limit: i64,
    pub offset: i64,
}

#[async_trait]
pub trait BannerQueries: Send {
    async fn get_banner_by_id(&mut self, id: i64) -> StoreResult<BannerRow>;

    /// Ids that do not exist are left out of the result.
    async fn get_banners_by_ids(&mut self, ids: &[i64]) -> StoreResult<Vec<BannerRow>>;

    async fn create_banner(&mut self, content: &str, is_active: bool) -> StoreResult<i64>;

    /// Persists `content` and `is_active` and refreshes `updated_at`.
    async fn update_banner(&mut self, id: i64, content: &str, is_active: bool) -> StoreResult<()>;

    async fn delete_banner(&mut self, id: i64) -> StoreResult<()>;

    async fn get_banner_by_feature_tag(
        &mut self,
        feature_id: i64,
        tag_id: i64,
    ) -> StoreResult<BannerRow>;

    /// Distinct banner ids matching the filter, ordered by banner id.
    async fn get_assignment_ids_by_feature_tag(
        &mut self,
        filter: AssignmentFilter,
    ) -> StoreResult<Vec<i64>>;

    async fn get_assignments_by_banner_ids(&mut self, ids: &[i64])
        -> StoreResult<Vec<Assignment>>;

    async fn get_assignments_by_banner_id(&mut self, id: i64) -> StoreResult<Vec<Assignment>>;

    /// Inserts one row per tag. Fails with [`StoreError::UniqueViolation`] when any
    /// (feature, tag) pair is already taken.
    async fn create_assignments(
        &mut self,
        feature_id: i64,
        tag_ids: &[i64],
        banner_id: i64,
    ) -> StoreResult<()>;

    /// Returns how many rows were removed; zero is not an error.
    async fn delete_assignments_by_banner_id(&mut self, id: i64) -> StoreResult<u64>;
}

#[async_trait]
pub trait Transaction: BannerQueries + Sized {
    /// Like [`BannerQueries::get_banner_by_id`], but holds the row lock until the
    /// transaction ends.
    async fn lock_banner_by_id(&mut self, id: i64) -> StoreResult<BannerRow>;

    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}

/// A row store able to hand out standalone connections and exclusive transactions.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Connection: BannerQueries;
    type Transaction: Transaction;

    async fn connection(&self) -> StoreResult<Self::Connection>;

    async fn begin(&self) -> StoreResult<Self::Transaction>;
}
