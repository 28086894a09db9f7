use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::instrument;

use super::auth::{AdminCaller, Caller};
use super::errors::BannerError;
use super::types::{CreatedResponse, QueryParams};
use crate::router::AppState;
use crate::service::{
    AdminBanners, BannerContent, BannerPatch, BannerView, ListQuery, NewBanner, UserBanners,
};

pub async fn index() -> &'static str {
    "banners"
}

#[instrument(skip_all)]
pub async fn user_banner<A: AdminBanners, U: UserBanners>(
    State(state): State<AppState<A, U>>,
    caller: Caller,
    Query(params): Query<QueryParams>,
) -> Result<Json<BannerContent>, BannerError> {
    let feature_id = params
        .int("feature_id")
        .ok_or_else(|| BannerError::BadInput("feature_id invalid or missing".to_owned()))?;
    let tag_id = params
        .int("tag_id")
        .ok_or_else(|| BannerError::BadInput("tag_id invalid or missing".to_owned()))?;
    let force_fresh = params.boolean("use_last_revision").unwrap_or(false);

    let content = state
        .lookup
        .get(feature_id, tag_id, caller.role.is_admin(), force_fresh)
        .await?;

    Ok(Json(content))
}

#[instrument(skip_all)]
pub async fn list_banners<A: AdminBanners, U: UserBanners>(
    State(state): State<AppState<A, U>>,
    _admin: AdminCaller,
    Query(params): Query<QueryParams>,
) -> Result<Json<Vec<BannerView>>, BannerError> {
    let query = ListQuery {
        feature_id: params.int("feature_id"),
        tag_id: params.int("tag_id"),
        limit: params.int("limit"),
        offset: params.int("offset"),
    };

    Ok(Json(state.admin.get_all(query).await?))
}

#[instrument(skip_all)]
pub async fn create_banner<A: AdminBanners, U: UserBanners>(
    State(state): State<AppState<A, U>>,
    _admin: AdminCaller,
    payload: Result<Json<NewBanner>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedResponse>), BannerError> {
    let Json(banner) = payload.map_err(bad_body)?;

    let banner_id = state.admin.create(banner).await?;

    Ok((StatusCode::CREATED, Json(CreatedResponse { banner_id })))
}

#[instrument(skip_all)]
pub async fn update_banner<A: AdminBanners, U: UserBanners>(
    State(state): State<AppState<A, U>>,
    _admin: AdminCaller,
    Path(id): Path<String>,
    payload: Result<Json<BannerPatch>, JsonRejection>,
) -> Result<StatusCode, BannerError> {
    let banner_id = parse_banner_id(&id)?;
    let Json(patch) = payload.map_err(bad_body)?;

    state.admin.update(banner_id, patch).await?;

    Ok(StatusCode::OK)
}

#[instrument(skip_all)]
pub async fn delete_banner<A: AdminBanners, U: UserBanners>(
    State(state): State<AppState<A, U>>,
    _admin: AdminCaller,
    Path(id): Path<String>,
) -> Result<StatusCode, BannerError> {
    let banner_id = parse_banner_id(&id)?;

    state.admin.delete(banner_id).await?;

    Ok(StatusCode::NO_CONTENT)
}

fn parse_banner_id(raw: &str) -> Result<i64, BannerError> {
    raw.parse()
        .map_err(|_| BannerError::BadInput("invalid banner id".to_owned()))
}

fn bad_body(rejection: JsonRejection) -> BannerError {
    BannerError::BadInput(rejection.body_text())
}
