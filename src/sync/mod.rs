//! Client-side optimistic vote and approval synchronization.
//!
//! Layers, leaves first: [`vote`] (pure toggle reducer), [`card`] (per-post
//! state store), [`gateway`] (backend contract and transports), [`status`]
//! (realtime approval subscriptions) and [`pipeline`] (the [`SyncClient`]
//! that composes them).

pub mod card;
pub mod gateway;
pub mod pipeline;
pub mod status;
pub mod vote;

pub use card::{ApprovalState, CardStore, CardView};
pub use gateway::{GatewayError, HttpGateway, LocalGateway, RemoteGateway};
pub use pipeline::{SyncClient, SyncConfig, SyncError, SyncEvent, WriteMode};
pub use status::{Backoff, BackoffConfig, StatusChannel};
