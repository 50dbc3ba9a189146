// src/lib.rs
//! Locally cached, eventually consistent view of server-side feature flags.
//!
//! A [`FlagStore`] loads the whole flag table from a [`FlagSource`], then
//! keeps it fresh through a [`ChangeFeed`] subscription. Reads go through
//! [`FlagStore::is_enabled`], which never blocks and fails closed.
//!
//! ```ignore
//! use flagstore::{FlagStore, RestSource, SseChangeFeed, StoreConfig};
//!
//! let store = FlagStore::builder()
//!     .with_source(RestSource::builder().with_base_url("https://db.example.com").build()?)
//!     .with_feed(SseChangeFeed::builder().with_stream_url("https://db.example.com/realtime/v1/feature_flags").build()?)
//!     .with_config(StoreConfig::from_env()?)
//!     .mount()?;
//!
//! if store.is_enabled("beta_marketplace") {
//!     // ...
//! }
//! ```
use thiserror::Error;

pub mod config;
pub mod feed;
pub mod flag;
pub mod source;
pub mod sse;
mod store;

#[cfg(feature = "tower-middleware")]
pub mod middleware;

#[cfg(feature = "tower-middleware")]
mod middleware_tests;

pub use crate::config::StoreConfig;
pub use crate::feed::{ChangeEvent, ChangeFeed, ChangeKind, FeedSignal, MemoryFeed, Subscription};
pub use crate::flag::{FeatureFlag, FlagSnapshot};
pub use crate::source::{FlagSource, RestSource, RestSourceBuilder};
pub use crate::sse::{SseChangeFeed, SseChangeFeedBuilder};
pub use crate::store::{FlagStore, FlagStoreBuilder};

#[derive(Debug, Error)]
pub enum FlagError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Subscription error: {0}")]
    SubscriptionError(String),
}
