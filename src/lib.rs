pub mod approval;
pub mod auth;
pub mod config;
pub mod error;
pub mod feed;
pub mod models;
pub mod openapi;
pub mod rate_limit;
pub mod repo;
pub mod routes;
pub mod storage;
pub mod sync;

// Re-export commonly used items for tests / external users
pub use feed::{ChangeFeed, Subscription};
pub use routes::{config, AppState};
