use std::ops::DerefMut;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{
    pool::PoolConnection,
    postgres::{PgPool, PgPoolOptions},
    PgConnection, Postgres,
};

use super::{
    Assignment, AssignmentFilter, BannerQueries, BannerRow, Store, StoreResult, Transaction,
};

const BANNER_COLUMNS: &str = "id, content, is_active, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct DatabaseTimeouts {
    pub statement_timeout: Duration,
    pub lock_timeout: Duration,
    pub acquire_timeout: Duration,
}

pub const DEFAULT_TIMEOUTS: DatabaseTimeouts = DatabaseTimeouts {
    statement_timeout: Duration::from_secs(2),
    lock_timeout: Duration::from_millis(500),
    acquire_timeout: Duration::from_millis(1000),
};

/// Banner storage backed by a Postgres connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(
        url: &str,
        max_connections: u32,
        timeouts: DatabaseTimeouts,
    ) -> Result<Self, sqlx::Error> {
        let statement_ms = timeouts.statement_timeout.as_millis();
        let lock_ms = timeouts.lock_timeout.as_millis();

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(timeouts.acquire_timeout)
            .test_before_acquire(true)
            // SET does not take bind parameters
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    sqlx::query(&format!("SET statement_timeout = '{statement_ms}ms'"))
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query(&format!("SET lock_timeout = '{lock_ms}ms'"))
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// A Postgres connection, either pooled or inside a transaction.
pub struct PgHandle<C>(C);

pub type PgConn = PgHandle<PoolConnection<Postgres>>;
pub type PgTransaction = PgHandle<sqlx::Transaction<'static, Postgres>>;

#[async_trait]
impl Store for PgStore {
    type Connection = PgConn;
    type Transaction = PgTransaction;

    async fn connection(&self) -> StoreResult<PgConn> {
        Ok(PgHandle(self.pool.acquire().await?))
    }

    async fn begin(&self) -> StoreResult<PgTransaction> {
        Ok(PgHandle(self.pool.begin().await?))
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn lock_banner_by_id(&mut self, id: i64) -> StoreResult<BannerRow> {
        let query = format!("SELECT {BANNER_COLUMNS} FROM banner WHERE id = $1 FOR UPDATE");
        let row = sqlx::query_as::<_, BannerRow>(&query)
            .bind(id)
            .fetch_one(&mut *self.0)
            .await?;

        Ok(row)
    }

    async fn commit(self) -> StoreResult<()> {
        Ok(self.0.commit().await?)
    }

    async fn rollback(self) -> StoreResult<()> {
        Ok(self.0.rollback().await?)
    }
}

#[async_trait]
impl<C> BannerQueries for PgHandle<C>
where
    C: DerefMut<Target = PgConnection> + Send,
{
    async fn get_banner_by_id(&mut self, id: i64) -> StoreResult<BannerRow> {
        let query = format!("SELECT {BANNER_COLUMNS} FROM banner WHERE id = $1");
        let row = sqlx::query_as::<_, BannerRow>(&query)
            .bind(id)
            .fetch_one(&mut *self.0)
            .await?;

        Ok(row)
    }

    async fn get_banners_by_ids(&mut self, ids: &[i64]) -> StoreResult<Vec<BannerRow>> {
        let query = format!("SELECT {BANNER_COLUMNS} FROM banner WHERE id = ANY($1)");
        let rows = sqlx::query_as::<_, BannerRow>(&query)
            .bind(ids)
            .fetch_all(&mut *self.0)
            .await?;

        Ok(rows)
    }

    async fn create_banner(&mut self, content: &str, is_active: bool) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
INSERT INTO banner (content, is_active)
VALUES ($1, $2)
RETURNING id
            "#,
        )
        .bind(content)
        .bind(is_active)
        .fetch_one(&mut *self.0)
        .await?;

        Ok(id)
    }

    async fn update_banner(&mut self, id: i64, content: &str, is_active: bool) -> StoreResult<()> {
        sqlx::query(
            r#"
UPDATE banner
SET
    content = $2,
    is_active = $3,
    updated_at = NOW()
WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(content)
        .bind(is_active)
        .execute(&mut *self.0)
        .await?;

        Ok(())
    }

    async fn delete_banner(&mut self, id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM banner WHERE id = $1")
            .bind(id)
            .execute(&mut *self.0)
            .await?;

        Ok(())
    }

    async fn get_banner_by_feature_tag(
        &mut self,
        feature_id: i64,
        tag_id: i64,
    ) -> StoreResult<BannerRow> {
        let row = sqlx::query_as::<_, BannerRow>(
            r#"
SELECT b.id, b.content, b.is_active, b.created_at, b.updated_at
FROM banner b
JOIN feature_tag_banner ftb ON ftb.banner_id = b.id
WHERE ftb.feature_id = $1 AND ftb.tag_id = $2
            "#,
        )
        .bind(feature_id)
        .bind(tag_id)
        .fetch_one(&mut *self.0)
        .await?;

        Ok(row)
    }

    async fn get_assignment_ids_by_feature_tag(
        &mut self,
        filter: AssignmentFilter,
    ) -> StoreResult<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
SELECT DISTINCT banner_id FROM feature_tag_banner
WHERE ($1::bigint IS NULL OR feature_id = $1)
  AND ($2::bigint IS NULL OR tag_id = $2)
ORDER BY banner_id
LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.feature_id)
        .bind(filter.tag_id)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&mut *self.0)
        .await?;

        Ok(ids)
    }

    async fn get_assignments_by_banner_ids(
        &mut self,
        ids: &[i64],
    ) -> StoreResult<Vec<Assignment>> {
        let rows = sqlx::query_as::<_, Assignment>(
            r#"
SELECT banner_id, feature_id, tag_id FROM feature_tag_banner
WHERE banner_id = ANY($1)
ORDER BY banner_id, tag_id
            "#,
        )
        .bind(ids)
        .fetch_all(&mut *self.0)
        .await?;

        Ok(rows)
    }

    async fn get_assignments_by_banner_id(&mut self, id: i64) -> StoreResult<Vec<Assignment>> {
        let rows = sqlx::query_as::<_, Assignment>(
            r#"
SELECT banner_id, feature_id, tag_id FROM feature_tag_banner
WHERE banner_id = $1
ORDER BY tag_id
            "#,
        )
        .bind(id)
        .fetch_all(&mut *self.0)
        .await?;

        Ok(rows)
    }

    async fn create_assignments(
        &mut self,
        feature_id: i64,
        tag_ids: &[i64],
        banner_id: i64,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
INSERT INTO feature_tag_banner (feature_id, tag_id, banner_id)
SELECT $1, tag_id, $3 FROM UNNEST($2::bigint[]) AS src(tag_id)
            "#,
        )
        .bind(feature_id)
        .bind(tag_ids)
        .bind(banner_id)
        .execute(&mut *self.0)
        .await?;

        Ok(())
    }

    async fn delete_assignments_by_banner_id(&mut self, id: i64) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM feature_tag_banner WHERE banner_id = $1")
            .bind(id)
            .execute(&mut *self.0)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;

    async fn insert_banner_with_tags(
        store: &PgStore,
        feature_id: i64,
        tag_ids: &[i64],
        active: bool,
    ) -> i64 {
        let mut tx = store.begin().await.unwrap();
        let id = tx
            .create_banner(r#"{"title":"example"}"#, active)
            .await
            .unwrap();
        tx.create_assignments(feature_id, tag_ids, id).await.unwrap();
        tx.commit().await.unwrap();
        id
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore]
    async fn test_create_and_fetch_banner(db: PgPool) {
        let store = PgStore::from_pool(db);
        let id = insert_banner_with_tags(&store, 1, &[1, 2, 3], true).await;

        let mut conn = store.connection().await.unwrap();
        let banner = conn.get_banner_by_id(id).await.unwrap();
        assert_eq!(banner.content, r#"{"title":"example"}"#);
        assert!(banner.is_active);

        let assignments = conn.get_assignments_by_banner_id(id).await.unwrap();
        assert_eq!(
            assignments.iter().map(|a| a.tag_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(assignments.iter().all(|a| a.feature_id == 1));

        let by_pair = conn.get_banner_by_feature_tag(1, 2).await.unwrap();
        assert_eq!(by_pair.id, id);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore]
    async fn test_missing_rows_are_not_found(db: PgPool) {
        let store = PgStore::from_pool(db);
        let mut conn = store.connection().await.unwrap();

        match conn.get_banner_by_id(42).await {
            Err(StoreError::NotFound) => (),
            other => panic!("Expected NotFound, got {:?}", other),
        };
        match conn.get_banner_by_feature_tag(1, 1).await {
            Err(StoreError::NotFound) => (),
            other => panic!("Expected NotFound, got {:?}", other),
        };
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore]
    async fn test_duplicate_pair_is_a_unique_violation(db: PgPool) {
        let store = PgStore::from_pool(db);
        insert_banner_with_tags(&store, 1, &[1], true).await;

        let mut tx = store.begin().await.unwrap();
        let id = tx.create_banner("{}", true).await.unwrap();
        match tx.create_assignments(1, &[5, 1], id).await {
            Err(StoreError::UniqueViolation(_)) => (),
            other => panic!("Expected UniqueViolation, got {:?}", other),
        };
        tx.rollback().await.unwrap();

        let mut conn = store.connection().await.unwrap();
        let ids = conn
            .get_assignment_ids_by_feature_tag(AssignmentFilter {
                feature_id: Some(1),
                tag_id: None,
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore]
    async fn test_batch_lookups_skip_missing_ids(db: PgPool) {
        let store = PgStore::from_pool(db);
        let first = insert_banner_with_tags(&store, 1, &[1, 2], true).await;
        let second = insert_banner_with_tags(&store, 2, &[1], false).await;

        let mut conn = store.connection().await.unwrap();
        let banners = conn
            .get_banners_by_ids(&[first, second, 9_999])
            .await
            .unwrap();
        assert_eq!(banners.len(), 2);

        let assignments = conn
            .get_assignments_by_banner_ids(&[first, second])
            .await
            .unwrap();
        assert_eq!(assignments.len(), 3);

        let by_tag = conn
            .get_assignment_ids_by_feature_tag(AssignmentFilter {
                feature_id: None,
                tag_id: Some(1),
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(by_tag, vec![first, second]);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore]
    async fn test_update_and_delete(db: PgPool) {
        let store = PgStore::from_pool(db);
        let id = insert_banner_with_tags(&store, 3, &[7], true).await;

        let mut conn = store.connection().await.unwrap();
        let before = conn.get_banner_by_id(id).await.unwrap();
        conn.update_banner(id, r#"{"title":"changed"}"#, false)
            .await
            .unwrap();
        let after = conn.get_banner_by_id(id).await.unwrap();
        assert_eq!(after.content, r#"{"title":"changed"}"#);
        assert!(!after.is_active);
        assert!(after.updated_at >= before.updated_at);

        assert_eq!(conn.delete_assignments_by_banner_id(id).await.unwrap(), 1);
        assert_eq!(conn.delete_assignments_by_banner_id(id).await.unwrap(), 0);
        conn.delete_banner(id).await.unwrap();
        assert!(matches!(
            conn.get_banner_by_id(id).await,
            Err(StoreError::NotFound)
        ));
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore]
    async fn test_locked_banner_blocks_other_writers(db: PgPool) {
        let store = PgStore::from_pool(db);
        let id = insert_banner_with_tags(&store, 4, &[1], true).await;

        let mut first = store.begin().await.unwrap();
        first.lock_banner_by_id(id).await.unwrap();

        let contender = store.clone();
        let waiting = tokio::spawn(async move {
            let mut second = contender.begin().await.unwrap();
            let row = second.lock_banner_by_id(id).await.unwrap();
            second.commit().await.unwrap();
            row
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!waiting.is_finished());

        first
            .update_banner(id, r#"{"title":"first"}"#, false)
            .await
            .unwrap();
        first.commit().await.unwrap();

        let seen = waiting.await.unwrap();
        assert_eq!(seen.content, r#"{"title":"first"}"#);
        assert!(!seen.is_active);
    }
}
