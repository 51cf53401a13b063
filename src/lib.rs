//! Predictive local media cache.
//!
//! Sits between media clients and a remote media server: observes playback,
//! pre-downloads what the user is likely to watch next, and serves it back
//! with range streaming, falling back to the upstream on a cache miss.

pub mod cache_fs;
pub mod config;
pub mod download;
pub mod predictor;
pub mod progress;
pub mod rate;
pub mod server;
pub mod store;
pub mod upstream;

pub use cache_fs::CacheFilesystem;
pub use config::Config;
pub use download::DownloadManager;
pub use predictor::Predictor;
pub use progress::ProgressBus;
pub use rate::RateScheduler;
pub use store::{MetadataStore, SqliteMetadataStore};
pub use upstream::{HttpUpstreamClient, UpstreamClient};
