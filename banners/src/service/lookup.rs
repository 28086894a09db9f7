use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use super::{parse_content, BannerContent};
use crate::api::errors::BannerError;
use crate::cache::BannerCache;
use crate::store::{BannerQueries, BannerRow, Store};

/// The user-facing banner read.
#[async_trait]
pub trait UserBanners: Send + Sync + 'static {
    /// Resolves the banner assigned to (`feature_id`, `tag_id`).
    ///
    /// Inactive banners are only visible to admins. `force_fresh` skips the cache and
    /// refreshes it from the store.
    async fn get(
        &self,
        feature_id: i64,
        tag_id: i64,
        is_admin: bool,
        force_fresh: bool,
    ) -> Result<BannerContent, BannerError>;
}

pub struct LookupService<S> {
    store: S,
    cache: BannerCache,
    ttl: Duration,
}

impl<S: Store> LookupService<S> {
    /// A zero `ttl` keeps cached rows until they are evicted for space.
    pub fn new(store: S, cache: BannerCache, ttl: Duration) -> Self {
        Self { store, cache, ttl }
    }

    async fn fetch(&self, feature_id: i64, tag_id: i64) -> Result<BannerRow, BannerError> {
        let mut conn = self.store.connection().await.map_err(BannerError::Store)?;
        Ok(conn.get_banner_by_feature_tag(feature_id, tag_id).await?)
    }
}

#[async_trait]
impl<S: Store> UserBanners for LookupService<S> {
    #[instrument(skip(self))]
    async fn get(
        &self,
        feature_id: i64,
        tag_id: i64,
        is_admin: bool,
        force_fresh: bool,
    ) -> Result<BannerContent, BannerError> {
        let key = (feature_id, tag_id);

        let cached = if force_fresh {
            None
        } else {
            self.cache.get(&key)
        };
        let source = match (&cached, force_fresh) {
            (Some(_), _) => "hit",
            (None, true) => "bypass",
            (None, false) => "miss",
        };
        metrics::counter!("banner_cache_lookups_total", "result" => source).increment(1);

        let row = match cached {
            Some(row) => row,
            None => {
                let row = match self.fetch(feature_id, tag_id).await {
                    Err(BannerError::NotFound) => {
                        // A forced read may find the pair gone while an old row is cached.
                        self.cache.invalidate(&key);
                        return Err(BannerError::NotFound);
                    }
                    fetched => fetched?,
                };
                self.cache.set(key, row.clone(), self.ttl);
                row
            }
        };

        if !row.is_active && !is_admin {
            return Err(BannerError::NotFound);
        }

        parse_content(&row.content)
    }
}
