use std::future::ready;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, FromRef},
    routing::{get, patch, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::api::{auth, handlers};
use crate::auth::Authorizer;
use crate::metrics::track_metrics;
use crate::service::{AdminBanners, UserBanners};

pub struct AppState<A, U> {
    pub admin: Arc<A>,
    pub lookup: Arc<U>,
    pub authorizer: Arc<dyn Authorizer>,
}

impl<A, U> AppState<A, U> {
    pub fn new(admin: A, lookup: U, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            admin: Arc::new(admin),
            lookup: Arc::new(lookup),
            authorizer,
        }
    }
}

impl<A, U> Clone for AppState<A, U> {
    fn clone(&self) -> Self {
        Self {
            admin: self.admin.clone(),
            lookup: self.lookup.clone(),
            authorizer: self.authorizer.clone(),
        }
    }
}

impl<A, U> FromRef<AppState<A, U>> for Arc<dyn Authorizer> {
    fn from_ref(state: &AppState<A, U>) -> Self {
        state.authorizer.clone()
    }
}

pub fn router<A: AdminBanners, U: UserBanners>(
    state: AppState<A, U>,
    metrics: Option<PrometheusHandle>,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    let status_router = Router::new()
        .route("/", get(handlers::index))
        .route("/_readiness", get(handlers::index))
        .route("/_liveness", get(handlers::index));

    let banner_router = Router::new()
        .route("/auth/sign-in", post(auth::sign_in))
        .route("/user_banner", get(handlers::user_banner::<A, U>))
        .route(
            "/banner",
            get(handlers::list_banners::<A, U>).post(handlers::create_banner::<A, U>),
        )
        .route(
            "/banner/:id",
            patch(handlers::update_banner::<A, U>).delete(handlers::delete_banner::<A, U>),
        )
        .layer(ConcurrencyLimitLayer::new(concurrency_limit))
        .layer(DefaultBodyLimit::max(max_body_size));

    let router = Router::new()
        .merge(status_router)
        .merge(banner_router)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // The recorder is global, so it is only installed by the binary.
    match metrics {
        Some(recorder_handle) => {
            router.route("/metrics", get(move || ready(recorder_handle.render())))
        }
        None => router,
    }
}
