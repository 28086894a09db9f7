pub mod auth;
pub mod errors;
pub mod handlers;
pub mod types;

pub use errors::{BannerError, ErrorResponse};
