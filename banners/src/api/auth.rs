use std::sync::Arc;

use axum::async_trait;
use axum::extract::{FromRef, FromRequestParts, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::Json;

use super::errors::BannerError;
use super::types::{QueryParams, TokenResponse};
use crate::auth::{bearer_token, AuthError, Authorizer, Role};

/// Any caller holding a valid token.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub role: Role,
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
    Arc<dyn Authorizer>: FromRef<S>,
{
    type Rejection = BannerError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .map(|value| value.to_str().map_err(|_| AuthError::InvalidHeaderFormat))
            .transpose()?;
        let token = bearer_token(header)?;

        let authorizer = Arc::<dyn Authorizer>::from_ref(state);
        let role = authorizer.verify(token)?;

        Ok(Caller { role })
    }
}

/// A caller whose token carries the admin role.
#[derive(Debug, Clone, Copy)]
pub struct AdminCaller;

#[async_trait]
impl<S> FromRequestParts<S> for AdminCaller
where
    S: Send + Sync,
    Arc<dyn Authorizer>: FromRef<S>,
{
    type Rejection = BannerError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let caller = Caller::from_request_parts(parts, state).await?;
        if !caller.role.is_admin() {
            return Err(BannerError::Forbidden);
        }
        Ok(AdminCaller)
    }
}

pub async fn sign_in(
    State(authorizer): State<Arc<dyn Authorizer>>,
    Query(params): Query<QueryParams>,
) -> Result<Json<TokenResponse>, BannerError> {
    let role: Role = params
        .string("role")
        .unwrap_or_default()
        .parse()
        .map_err(|e: AuthError| BannerError::BadInput(e.to_string()))?;

    let access_token = authorizer.issue(role).map_err(BannerError::TokenIssuing)?;

    Ok(Json(TokenResponse { access_token }))
}
