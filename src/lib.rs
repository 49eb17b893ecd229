//! shellcache - an offline cache for a web application's shell and assets.
//!
//! A [`CacheLifecycle`] keeps three named partitions in sync with a
//! [`Deployment`] (a resource manifest plus the list of core shell files):
//! install stages the shell, activate reconciles the content partition with
//! the previously activated manifest, and fetch interception serves manifest
//! resources from cache.
//!
//! # Example
//!
//! ```no_run
//! use shellcache::{
//!     CacheConfig, CacheLifecycle, Deployment, FetchOutcome, FetchRequest, HttpFetcher,
//!     MemoryStorage,
//! };
//!
//! # async fn example() -> shellcache::Result<()> {
//! let config = CacheConfig::new().with_origin("https://app.example.com");
//! let deployment = Deployment::load(std::path::Path::new("deployment.json"))?;
//! let fetcher = HttpFetcher::new(&config)?;
//! let mut lifecycle = CacheLifecycle::new(config, deployment, MemoryStorage::new(), fetcher);
//!
//! lifecycle.install().await?;
//! let report = lifecycle.activate().await;
//! println!("Promoted {} shell files", report.promoted);
//!
//! let request = FetchRequest::get("https://app.example.com/main.dart.js");
//! if let FetchOutcome::Response(response) = lifecycle.handle_fetch(&request).await? {
//!     println!("{} bytes", response.len());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod error;
pub mod fetch;
pub mod key;
pub mod lifecycle;
pub mod manifest;
pub mod response;
pub mod stats;
pub mod storage;

#[cfg(feature = "cli")]
pub mod cli;
#[cfg(feature = "server")]
pub mod proxy;

// Re-export main types for convenience
pub use config::{AppConfig, CacheConfig, PartitionNames, ProxyConfig};
pub use error::{Error, Result};
pub use fetch::{FetchRequest, Fetcher, HttpFetcher};
pub use lifecycle::{
    CacheLifecycle, ControlMessage, FetchOutcome, FetchProgress, LifecycleState, MessageOutcome,
    NoProgress, SharedLifecycle,
};
pub use manifest::{Deployment, ResourceManifest};
pub use response::CachedResponse;
pub use stats::{ActivationKind, ActivationReport, CacheStatus, OfflineReport};
pub use storage::{CacheStorage, DiskStorage, MemoryStorage};
