//! Banner use cases on top of a [`Store`].
//!
//! [`admin`] keeps a banner row and its feature/tag assignments consistent across
//! create, update and delete. [`lookup`] serves the user-facing read through a cache.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::api::errors::BannerError;
use crate::store::{Store, Transaction};

pub mod admin;
pub mod lookup;

pub use admin::{AdminBannerService, AdminBanners};
pub use lookup::{LookupService, UserBanners};

/// A banner payload. Always a JSON object.
pub type BannerContent = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NewBanner {
    pub tag_ids: Vec<i64>,
    pub feature_id: i64,
    pub content: BannerContent,
    pub is_active: bool,
}

/// Fields left as `None` keep their recorded value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct BannerPatch {
    pub tag_ids: Option<Vec<i64>>,
    pub feature_id: Option<i64>,
    pub content: Option<BannerContent>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub feature_id: Option<i64>,
    pub tag_id: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// One banner of the admin listing, joined with its assignments.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BannerView {
    pub banner_id: i64,
    pub tag_ids: Vec<i64>,
    pub feature_id: i64,
    pub content: BannerContent,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) fn parse_content(raw: &str) -> Result<BannerContent, BannerError> {
    serde_json::from_str(raw).map_err(BannerError::ContentParsing)
}

pub(crate) fn serialize_content(content: &BannerContent) -> Result<String, BannerError> {
    serde_json::to_string(content).map_err(BannerError::ContentSerialization)
}

/// Sorts and dedupes tag ids, rejecting an empty list.
pub(crate) fn normalize_tag_ids(mut tag_ids: Vec<i64>) -> Result<Vec<i64>, BannerError> {
    if tag_ids.is_empty() {
        return Err(BannerError::BadInput("tag_ids must not be empty".to_owned()));
    }
    tag_ids.sort_unstable();
    tag_ids.dedup();
    Ok(tag_ids)
}

/// Runs `work` inside one store transaction.
///
/// Commits when `work` succeeds. On any error the transaction is rolled back and the
/// original error returned; if the rollback fails as well, both are reported through
/// [`BannerError::RollbackFailed`].
pub async fn in_transaction<S, T, F>(
    store: &S,
    operation: &'static str,
    work: F,
) -> Result<T, BannerError>
where
    S: Store,
    T: Send,
    F: for<'t> FnOnce(&'t mut S::Transaction) -> BoxFuture<'t, Result<T, BannerError>> + Send,
{
    let mut tx = store.begin().await.map_err(|e| {
        report_outcome(operation, "begin_failed");
        BannerError::Store(e)
    })?;

    match work(&mut tx).await {
        Ok(value) => {
            tx.commit().await.map_err(|e| {
                report_outcome(operation, "commit_failed");
                BannerError::Store(e)
            })?;
            report_outcome(operation, "committed");
            Ok(value)
        }
        Err(error) => match tx.rollback().await {
            Ok(()) => {
                report_outcome(operation, "rolled_back");
                Err(error)
            }
            Err(rollback) => {
                report_outcome(operation, "rollback_failed");
                Err(BannerError::RollbackFailed {
                    source: Box::new(error),
                    rollback,
                })
            }
        },
    }
}

fn report_outcome(operation: &'static str, outcome: &'static str) {
    if outcome != "committed" {
        tracing::debug!(operation, outcome, "transaction did not commit");
    }
    metrics::counter!(
        "banner_transactions_total",
        &[("operation", operation), ("outcome", outcome)]
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BannerQueries, MemoryStore, StoreError, StoreOp};

    #[tokio::test]
    async fn test_commits_on_success() {
        let store = MemoryStore::new();

        let id = in_transaction(&store, "test", |tx| {
            Box::pin(async move {
                let id = tx.create_banner("{}", true).await?;
                Ok::<_, BannerError>(id)
            })
        })
        .await
        .unwrap();

        assert!(store.snapshot().await.banners.contains_key(&id));
    }

    #[tokio::test]
    async fn test_rolls_back_and_keeps_the_original_error() {
        let store = MemoryStore::new();

        let result: Result<(), _> = in_transaction(&store, "test", |tx| {
            Box::pin(async move {
                tx.create_banner("{}", true).await?;
                Err::<(), _>(BannerError::BadInput("nope".to_owned()))
            })
        })
        .await;

        assert!(matches!(result, Err(BannerError::BadInput(_))));
        assert!(store.snapshot().await.banners.is_empty());
    }

    #[tokio::test]
    async fn test_failed_rollback_reports_both_errors() {
        let store = MemoryStore::new();
        store.fail_on(StoreOp::Rollback);

        let result: Result<(), _> = in_transaction(&store, "test", |tx| {
            Box::pin(async move {
                tx.create_banner("{}", true).await?;
                Err::<(), _>(BannerError::Conflict)
            })
        })
        .await;

        match result {
            Err(BannerError::RollbackFailed { source, rollback }) => {
                assert!(matches!(*source, BannerError::Conflict));
                assert!(matches!(rollback, StoreError::Backend(_)));
            }
            other => panic!("Expected RollbackFailed, got {:?}", other),
        };
        assert!(store.snapshot().await.banners.is_empty());
    }

    #[tokio::test]
    async fn test_begin_and_commit_failures_are_internal() {
        let store = MemoryStore::new();

        store.fail_on(StoreOp::Begin);
        let begin = in_transaction(&store, "test", |_tx| {
            Box::pin(async move { Ok::<_, BannerError>(()) })
        })
        .await;
        assert!(begin.unwrap_err().is_internal());

        store.clear_faults();
        store.fail_on(StoreOp::Commit);
        let commit = in_transaction(&store, "test", |tx| {
            Box::pin(async move {
                let id = tx.create_banner("{}", true).await?;
                Ok::<_, BannerError>(id)
            })
        })
        .await;
        assert!(commit.unwrap_err().is_internal());
        assert!(store.snapshot().await.banners.is_empty());
    }

    #[test]
    fn test_normalize_tag_ids() {
        assert_eq!(normalize_tag_ids(vec![3, 1, 3, 2]).unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            normalize_tag_ids(vec![]),
            Err(BannerError::BadInput(_))
        ));
    }

    #[test]
    fn test_content_must_be_an_object() {
        assert!(parse_content(r#"{"title":"hi"}"#).is_ok());
        assert!(matches!(
            parse_content("[1, 2]"),
            Err(BannerError::ContentParsing(_))
        ));
    }
}
