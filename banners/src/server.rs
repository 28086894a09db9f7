use std::future::Future;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;

use crate::auth::{Authorizer, JwtAuthorizer};
use crate::cache::BannerCache;
use crate::config::Config;
use crate::router::{router, AppState};
use crate::service::{AdminBannerService, LookupService};
use crate::store::{MemoryStore, PgStore, Store};

/// Builds the services on top of `store` and wires them into the router.
pub fn app<S: Store + Clone>(
    config: &Config,
    store: S,
    metrics: Option<PrometheusHandle>,
) -> axum::Router {
    let authorizer: Arc<dyn Authorizer> = Arc::new(JwtAuthorizer::new(
        &config.jwt_signing_key,
        config.token_ttl(),
    ));
    let cache = BannerCache::new(config.cache_max_entries);

    let state = AppState::new(
        AdminBannerService::with_default_limit(store.clone(), config.default_list_limit),
        LookupService::new(store, cache, config.cache_ttl()),
        authorizer,
    );

    router(
        state,
        metrics,
        config.max_body_size,
        config.concurrency_limit,
    )
}

pub async fn serve<F>(
    config: Config,
    listener: TcpListener,
    metrics: Option<PrometheusHandle>,
    shutdown: F,
) -> Result<(), anyhow::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = if config.memory_store {
        tracing::warn!("serving banners from process memory, nothing will be persisted");
        app(&config, MemoryStore::new(), metrics)
    } else {
        let store = PgStore::connect(
            &config.database_url,
            config.max_pg_connections,
            config.database_timeouts(),
        )
        .await?;
        app(&config, store, metrics)
    };

    tracing::info!("listening on {:?}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
