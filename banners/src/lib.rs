pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod metrics;
pub mod router;
pub mod server;
pub mod service;
pub mod store;
