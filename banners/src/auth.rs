use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::User => write!(f, "user"),
        }
    }
}

impl FromStr for Role {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            invalid => Err(AuthError::UnknownRole(invalid.to_owned())),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingHeader,
    #[error("invalid Authorization header format")]
    InvalidHeaderFormat,
    #[error("token is empty")]
    EmptyToken,
    #[error("{0} is not a valid role")]
    UnknownRole(String),
    #[error("JWT error: {0}")]
    JwtError(Box<jsonwebtoken::errors::Error>),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub role: Role,
    pub exp: i64,
    pub iat: i64,
}

/// Issues and checks bearer tokens carrying a [`Role`].
pub trait Authorizer: Send + Sync + 'static {
    fn issue(&self, role: Role) -> Result<String, AuthError>;

    fn verify(&self, token: &str) -> Result<Role, AuthError>;
}

/// HS256 tokens signed with a shared secret.
#[derive(Clone)]
pub struct JwtAuthorizer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_ttl: Duration,
}

impl JwtAuthorizer {
    pub fn new(signing_key: &str, token_ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(signing_key.as_bytes()),
            decoding_key: DecodingKey::from_secret(signing_key.as_bytes()),
            token_ttl,
        }
    }
}

impl Authorizer for JwtAuthorizer {
    fn issue(&self, role: Role) -> Result<String, AuthError> {
        let iat = Utc::now().timestamp();
        let ttl = i64::try_from(self.token_ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            role,
            iat,
            exp: iat.saturating_add(ttl),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::JwtError(Box::new(e)))
    }

    fn verify(&self, token: &str) -> Result<Role, AuthError> {
        if token.is_empty() {
            return Err(AuthError::EmptyToken);
        }

        let token_data = decode::<Claims>(
            token,
            &self.decoding_key,
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|e| AuthError::JwtError(Box::new(e)))?;

        Ok(token_data.claims.role)
    }
}

/// Pull the token out of an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let header = header.ok_or(AuthError::MissingHeader)?;

    let mut parts = header.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("Bearer"), Some(""), None) => Err(AuthError::EmptyToken),
        (Some("Bearer"), Some(token), None) => Ok(token),
        _ => Err(AuthError::InvalidHeaderFormat),
    }
}
