use std::collections::HashMap;

use async_trait::async_trait;
use tracing::instrument;

use super::{
    in_transaction, normalize_tag_ids, parse_content, serialize_content, BannerPatch,
    BannerView, ListQuery, NewBanner,
};
use crate::api::errors::BannerError;
use crate::store::{AssignmentFilter, BannerQueries, BannerRow, Store, Transaction};

pub const DEFAULT_LIST_LIMIT: i64 = 10;

/// Administrative banner management.
#[async_trait]
pub trait AdminBanners: Send + Sync + 'static {
    /// Creates a banner and assigns it to every tag under `feature_id`.
    async fn create(&self, banner: NewBanner) -> Result<i64, BannerError>;

    async fn get_all(&self, query: ListQuery) -> Result<Vec<BannerView>, BannerError>;

    /// Applies `patch` and rewrites the banner's assignments from scratch.
    async fn update(&self, banner_id: i64, patch: BannerPatch) -> Result<(), BannerError>;

    /// Removes the banner together with all of its assignments.
    async fn delete(&self, banner_id: i64) -> Result<(), BannerError>;
}

pub struct AdminBannerService<S> {
    store: S,
    default_limit: i64,
}

impl<S: Store> AdminBannerService<S> {
    pub fn new(store: S) -> Self {
        Self::with_default_limit(store, DEFAULT_LIST_LIMIT)
    }

    pub fn with_default_limit(store: S, default_limit: i64) -> Self {
        Self {
            store,
            default_limit,
        }
    }
}

#[async_trait]
impl<S: Store> AdminBanners for AdminBannerService<S> {
    #[instrument(skip_all, fields(feature_id = banner.feature_id))]
    async fn create(&self, banner: NewBanner) -> Result<i64, BannerError> {
        let tag_ids = normalize_tag_ids(banner.tag_ids)?;
        let content = serialize_content(&banner.content)?;
        let (feature_id, is_active) = (banner.feature_id, banner.is_active);

        let banner_id = in_transaction(&self.store, "create", move |tx| {
            Box::pin(async move {
                let banner_id = tx.create_banner(&content, is_active).await?;
                tx.create_assignments(feature_id, &tag_ids, banner_id)
                    .await?;
                Ok::<_, BannerError>(banner_id)
            })
        })
        .await?;

        tracing::info!(banner_id, "created banner");
        Ok(banner_id)
    }

    #[instrument(skip_all)]
    async fn get_all(&self, query: ListQuery) -> Result<Vec<BannerView>, BannerError> {
        let filter = AssignmentFilter {
            feature_id: query.feature_id,
            tag_id: query.tag_id,
            limit: query.limit.unwrap_or(self.default_limit),
            offset: query.offset.unwrap_or(0),
        };
        if filter.limit < 0 || filter.offset < 0 {
            return Err(BannerError::BadInput(
                "limit and offset must not be negative".to_owned(),
            ));
        }

        let mut conn = self.store.connection().await.map_err(BannerError::Store)?;

        let ids = conn.get_assignment_ids_by_feature_tag(filter).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let banners = conn.get_banners_by_ids(&ids).await?;
        let assignments = conn.get_assignments_by_banner_ids(&ids).await?;

        let mut rows: HashMap<i64, BannerRow> =
            banners.into_iter().map(|row| (row.id, row)).collect();
        let mut tags: HashMap<i64, (i64, Vec<i64>)> = HashMap::new();
        for assignment in assignments {
            tags.entry(assignment.banner_id)
                .or_insert_with(|| (assignment.feature_id, Vec::new()))
                .1
                .push(assignment.tag_id);
        }

        let mut views = Vec::with_capacity(ids.len());
        for id in ids {
            // Either side may have been deleted between the reads.
            let Some(row) = rows.remove(&id) else {
                continue;
            };
            let content = match parse_content(&row.content) {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!(banner_id = id, "skipping banner: {}", e);
                    continue;
                }
            };
            let Some((feature_id, tag_ids)) = tags.remove(&id) else {
                continue;
            };

            views.push(BannerView {
                banner_id: row.id,
                tag_ids,
                feature_id,
                content,
                is_active: row.is_active,
                created_at: row.created_at,
                updated_at: row.updated_at,
            });
        }

        Ok(views)
    }

    #[instrument(skip(self, patch))]
    async fn update(&self, banner_id: i64, patch: BannerPatch) -> Result<(), BannerError> {
        let BannerPatch {
            tag_ids,
            feature_id,
            content,
            is_active,
        } = patch;
        let tag_ids = tag_ids.map(normalize_tag_ids).transpose()?;
        let content = content.as_ref().map(serialize_content).transpose()?;

        in_transaction(&self.store, "update", move |tx| {
            Box::pin(async move {
                let mut row = tx.lock_banner_by_id(banner_id).await?;
                if let Some(content) = content {
                    row.content = content;
                }
                if let Some(is_active) = is_active {
                    row.is_active = is_active;
                }
                tx.update_banner(banner_id, &row.content, row.is_active)
                    .await?;

                let recorded = tx.get_assignments_by_banner_id(banner_id).await?;
                let Some(first) = recorded.first() else {
                    return Err(BannerError::MissingAssignments(banner_id));
                };
                let feature_id = feature_id.unwrap_or(first.feature_id);
                let tag_ids =
                    tag_ids.unwrap_or_else(|| recorded.iter().map(|a| a.tag_id).collect());

                tx.delete_assignments_by_banner_id(banner_id).await?;
                tx.create_assignments(feature_id, &tag_ids, banner_id)
                    .await?;
                Ok::<_, BannerError>(())
            })
        })
        .await?;

        tracing::info!("updated banner");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, banner_id: i64) -> Result<(), BannerError> {
        in_transaction(&self.store, "delete", move |tx| {
            Box::pin(async move {
                tx.lock_banner_by_id(banner_id).await?;
                let removed = tx.delete_assignments_by_banner_id(banner_id).await?;
                tracing::debug!(removed, "removed assignments");
                tx.delete_banner(banner_id).await?;
                Ok::<_, BannerError>(())
            })
        })
        .await?;

        tracing::info!("deleted banner");
        Ok(())
    }
}
