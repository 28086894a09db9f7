use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{
    Assignment, AssignmentFilter, BannerQueries, BannerRow, Store, StoreError, StoreResult,
    Transaction,
};

/// Every step the in-memory store can be told to fail on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Connect,
    Begin,
    Commit,
    Rollback,
    GetBannerById,
    GetBannersByIds,
    CreateBanner,
    UpdateBanner,
    DeleteBanner,
    GetBannerByFeatureTag,
    GetAssignmentIds,
    GetAssignmentsByBannerIds,
    GetAssignmentsByBannerId,
    CreateAssignments,
    DeleteAssignments,
}

/// The full contents of the in-memory store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTables {
    pub banners: BTreeMap<i64, BannerRow>,
    /// (feature_id, tag_id) -> banner_id
    pub assignments: BTreeMap<(i64, i64), i64>,
    last_id: i64,
}

impl MemoryTables {
    fn banner(&self, id: i64) -> StoreResult<BannerRow> {
        self.banners.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    fn banners_by_ids(&self, ids: &[i64]) -> Vec<BannerRow> {
        ids.iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter_map(|id| self.banners.get(id).cloned())
            .collect()
    }

    fn create_banner(&mut self, content: &str, is_active: bool) -> i64 {
        self.last_id += 1;
        let now = Utc::now();
        self.banners.insert(
            self.last_id,
            BannerRow {
                id: self.last_id,
                content: content.to_owned(),
                is_active,
                created_at: now,
                updated_at: now,
            },
        );
        self.last_id
    }

    fn update_banner(&mut self, id: i64, content: &str, is_active: bool) {
        if let Some(row) = self.banners.get_mut(&id) {
            row.content = content.to_owned();
            row.is_active = is_active;
            row.updated_at = Utc::now();
        }
    }

    fn delete_banner(&mut self, id: i64) -> StoreResult<()> {
        if self.assignments.values().any(|banner_id| *banner_id == id) {
            return Err(StoreError::Backend(format!(
                "banner {id} is still referenced by feature_tag_banner"
            )));
        }
        self.banners.remove(&id);
        Ok(())
    }

    fn banner_by_feature_tag(&self, feature_id: i64, tag_id: i64) -> StoreResult<BannerRow> {
        let id = self
            .assignments
            .get(&(feature_id, tag_id))
            .ok_or(StoreError::NotFound)?;
        self.banner(*id)
    }

    fn assignment_ids(&self, filter: AssignmentFilter) -> Vec<i64> {
        let offset = usize::try_from(filter.offset).unwrap_or(0);
        let limit = usize::try_from(filter.limit).unwrap_or(0);

        self.assignments
            .iter()
            .filter(|((feature_id, tag_id), _)| {
                filter.feature_id.map_or(true, |f| f == *feature_id)
                    && filter.tag_id.map_or(true, |t| t == *tag_id)
            })
            .map(|(_, banner_id)| *banner_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect()
    }

    fn assignments_where(&self, keep: impl Fn(i64) -> bool) -> Vec<Assignment> {
        let mut rows: Vec<Assignment> = self
            .assignments
            .iter()
            .filter(|(_, banner_id)| keep(**banner_id))
            .map(|((feature_id, tag_id), banner_id)| Assignment {
                banner_id: *banner_id,
                feature_id: *feature_id,
                tag_id: *tag_id,
            })
            .collect();
        rows.sort_by_key(|a| (a.banner_id, a.tag_id));
        rows
    }

    fn create_assignments(
        &mut self,
        feature_id: i64,
        tag_ids: &[i64],
        banner_id: i64,
    ) -> StoreResult<()> {
        if !self.banners.contains_key(&banner_id) {
            return Err(StoreError::Backend(format!(
                "banner {banner_id} does not exist"
            )));
        }

        // The whole insert is one statement: check every row before writing any.
        let mut seen = HashSet::with_capacity(tag_ids.len());
        for tag_id in tag_ids {
            if !seen.insert(*tag_id) || self.assignments.contains_key(&(feature_id, *tag_id)) {
                return Err(StoreError::UniqueViolation(
                    "feature_tag_banner_feature_id_tag_id_key".to_owned(),
                ));
            }
        }

        for tag_id in tag_ids {
            self.assignments.insert((feature_id, *tag_id), banner_id);
        }
        Ok(())
    }

    fn delete_assignments(&mut self, banner_id: i64) -> u64 {
        let before = self.assignments.len();
        self.assignments.retain(|_, id| *id != banner_id);
        (before - self.assignments.len()) as u64
    }
}

#[derive(Clone, Default)]
struct Faults(Arc<Mutex<HashSet<StoreOp>>>);

impl Faults {
    fn check(&self, op: StoreOp) -> StoreResult<()> {
        let faults = self
            .0
            .lock()
            .map_err(|_| StoreError::Backend("fault registry poisoned".to_owned()))?;
        if faults.contains(&op) {
            return Err(StoreError::Backend(format!("injected failure on {op:?}")));
        }
        Ok(())
    }
}

/// A process-local store with the same contract as Postgres.
///
/// A transaction holds the store exclusively for its whole lifetime and works on a
/// private copy of the tables, which replaces the shared state only on commit.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<AsyncMutex<MemoryTables>>,
    faults: Faults,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call of `op` fail until [`MemoryStore::clear_faults`].
    pub fn fail_on(&self, op: StoreOp) {
        if let Ok(mut faults) = self.faults.0.lock() {
            faults.insert(op);
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.0.lock() {
            faults.clear();
        }
    }

    pub async fn snapshot(&self) -> MemoryTables {
        self.tables.lock().await.clone()
    }
}

pub struct MemoryConnection {
    tables: Arc<AsyncMutex<MemoryTables>>,
    faults: Faults,
}

impl MemoryConnection {
    async fn run<T, F>(&mut self, op: StoreOp, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut MemoryTables) -> StoreResult<T> + Send,
    {
        self.faults.check(op)?;
        let mut tables = self.tables.lock().await;
        f(&mut tables)
    }
}

pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryTables>,
    working: MemoryTables,
    faults: Faults,
}

impl MemoryTransaction {
    async fn run<T, F>(&mut self, op: StoreOp, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut MemoryTables) -> StoreResult<T> + Send,
    {
        self.faults.check(op)?;
        f(&mut self.working)
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Connection = MemoryConnection;
    type Transaction = MemoryTransaction;

    async fn connection(&self) -> StoreResult<MemoryConnection> {
        self.faults.check(StoreOp::Connect)?;
        Ok(MemoryConnection {
            tables: self.tables.clone(),
            faults: self.faults.clone(),
        })
    }

    async fn begin(&self) -> StoreResult<MemoryTransaction> {
        self.faults.check(StoreOp::Begin)?;
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        Ok(MemoryTransaction {
            guard,
            working,
            faults: self.faults.clone(),
        })
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    // The whole store is already held for the transaction's lifetime.
    async fn lock_banner_by_id(&mut self, id: i64) -> StoreResult<BannerRow> {
        self.run(StoreOp::GetBannerById, |t| t.banner(id)).await
    }

    async fn commit(mut self) -> StoreResult<()> {
        self.faults.check(StoreOp::Commit)?;
        *self.guard = self.working;
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        // Dropping the guard discards the working copy either way.
        self.faults.check(StoreOp::Rollback)
    }
}

macro_rules! memory_queries {
    ($handle:ty) => {
        #[async_trait]
        impl BannerQueries for $handle {
            async fn get_banner_by_id(&mut self, id: i64) -> StoreResult<BannerRow> {
                self.run(StoreOp::GetBannerById, |t| t.banner(id)).await
            }

            async fn get_banners_by_ids(&mut self, ids: &[i64]) -> StoreResult<Vec<BannerRow>> {
                self.run(StoreOp::GetBannersByIds, |t| Ok(t.banners_by_ids(ids)))
                    .await
            }

            async fn create_banner(&mut self, content: &str, is_active: bool) -> StoreResult<i64> {
                self.run(StoreOp::CreateBanner, |t| Ok(t.create_banner(content, is_active)))
                    .await
            }

            async fn update_banner(
                &mut self,
                id: i64,
                content: &str,
                is_active: bool,
            ) -> StoreResult<()> {
                self.run(StoreOp::UpdateBanner, |t| {
                    t.update_banner(id, content, is_active);
                    Ok(())
                })
                .await
            }

            async fn delete_banner(&mut self, id: i64) -> StoreResult<()> {
                self.run(StoreOp::DeleteBanner, |t| t.delete_banner(id)).await
            }

            async fn get_banner_by_feature_tag(
                &mut self,
                feature_id: i64,
                tag_id: i64,
            ) -> StoreResult<BannerRow> {
                self.run(StoreOp::GetBannerByFeatureTag, |t| {
                    t.banner_by_feature_tag(feature_id, tag_id)
                })
                .await
            }

            async fn get_assignment_ids_by_feature_tag(
                &mut self,
                filter: AssignmentFilter,
            ) -> StoreResult<Vec<i64>> {
                self.run(StoreOp::GetAssignmentIds, |t| Ok(t.assignment_ids(filter)))
                    .await
            }

            async fn get_assignments_by_banner_ids(
                &mut self,
                ids: &[i64],
            ) -> StoreResult<Vec<Assignment>> {
                self.run(StoreOp::GetAssignmentsByBannerIds, |t| {
                    Ok(t.assignments_where(|banner_id| ids.contains(&banner_id)))
                })
                .await
            }

            async fn get_assignments_by_banner_id(
                &mut self,
                id: i64,
            ) -> StoreResult<Vec<Assignment>> {
                self.run(StoreOp::GetAssignmentsByBannerId, |t| {
                    Ok(t.assignments_where(|banner_id| banner_id == id))
                })
                .await
            }

            async fn create_assignments(
                &mut self,
                feature_id: i64,
                tag_ids: &[i64],
                banner_id: i64,
            ) -> StoreResult<()> {
                self.run(StoreOp::CreateAssignments, |t| {
                    t.create_assignments(feature_id, tag_ids, banner_id)
                })
                .await
            }

            async fn delete_assignments_by_banner_id(&mut self, id: i64) -> StoreResult<u64> {
                self.run(StoreOp::DeleteAssignments, |t| Ok(t.delete_assignments(id)))
                    .await
            }
        }
    };
}

memory_queries!(MemoryConnection);
memory_queries!(MemoryTransaction);
