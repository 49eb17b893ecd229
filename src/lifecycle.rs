//! The cache lifecycle manager.
//!
//! One [`CacheLifecycle`] is one installed version of the application. The
//! host drives it through install, activate, fetch and message events:
//!
//! - **install** stages the core shell in the temp partition;
//! - **activate** reconciles the content partition against the manifest that
//!   was last activated, keeping entries whose fingerprint did not change;
//! - **fetch** serves manifest resources cache-first, except the root
//!   document which is served online-first;
//! - **message** handles `skipWaiting` and `downloadOffline`.
//!
//! If reconciliation fails part way, every partition is deleted so the next
//! install starts from a clean slate.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures::{StreamExt, TryStreamExt, stream};
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::fetch::{FetchRequest, Fetcher};
use crate::key::{self, ROOT_KEY};
use crate::manifest::{Deployment, ResourceManifest};
use crate::response::CachedResponse;
use crate::stats::{ActivationReport, CacheStatus, OfflineReport};
use crate::storage::CacheStorage;

/// Key of the single entry in the manifest partition.
pub const MANIFEST_ENTRY: &str = "manifest";

/// Request headers that make the origin answer with a partial, encoded or
/// conditional variant. They are dropped from fetches whose response may be
/// stored, so every entry holds the full identity-encoded body.
const VARIANT_HEADERS: [&str; 7] = [
    "range",
    "if-range",
    "if-match",
    "if-none-match",
    "if-modified-since",
    "if-unmodified-since",
    "accept-encoding",
];

/// Where an instance is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Created, not yet installed.
    Parsed,
    /// Fetching the core shell.
    Installing,
    /// Shell staged; waiting to activate.
    Installed,
    /// Reconciling partitions.
    Activating,
    /// Serving requests.
    Activated,
    /// Install failed; this instance will never activate.
    Redundant,
}

/// Control messages a client can post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Activate a waiting instance without waiting for old clients to go away.
    SkipWaiting,
    /// Fetch every manifest resource not yet cached.
    DownloadOffline,
}

impl FromStr for ControlMessage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "skipWaiting" => Ok(Self::SkipWaiting),
            "downloadOffline" => Ok(Self::DownloadOffline),
            other => Err(format!("unknown control message {other:?}")),
        }
    }
}

/// Result of handling an intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Not ours; the host should perform its default handling.
    Passthrough,
    /// Response served from cache or network.
    Response(CachedResponse),
}

/// Result of handling a control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Skip-waiting was requested.
    SkipWaiting,
    /// The offline download ran to completion.
    Downloaded(OfflineReport),
    /// The message was not recognized.
    Ignored,
}

/// Trait for receiving progress updates while fetching many resources.
///
/// All methods have default no-op implementations.
pub trait FetchProgress: Send + Sync {
    /// Called once with the number of resources about to be fetched.
    fn on_start(&self, _total: usize) {}

    /// Called when a resource has been fetched.
    fn on_fetched(&self, _url: &str, _bytes: u64) {}

    /// Called when a resource could not be fetched.
    fn on_error(&self, _url: &str, _error: &str) {}
}

/// A null progress implementation that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl FetchProgress for NoProgress {}

/// One installed version of the application and its cache partitions.
pub struct CacheLifecycle<S: CacheStorage, F: Fetcher> {
    id: Uuid,
    config: CacheConfig,
    deployment: Deployment,
    storage: S,
    fetcher: F,
    state: LifecycleState,
    skip_waiting: AtomicBool,
    controls_clients: AtomicBool,
}

impl<S: CacheStorage, F: Fetcher> CacheLifecycle<S, F> {
    /// Creates a new, not yet installed instance.
    #[must_use]
    pub fn new(config: CacheConfig, deployment: Deployment, storage: S, fetcher: F) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            deployment,
            storage,
            fetcher,
            state: LifecycleState::Parsed,
            skip_waiting: AtomicBool::new(false),
            controls_clients: AtomicBool::new(false),
        }
    }

    /// Returns this instance's id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub const fn state(&self) -> LifecycleState {
        self.state
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the deployment this instance serves.
    #[must_use]
    pub const fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    /// Returns the underlying storage.
    #[must_use]
    pub const fn storage(&self) -> &S {
        &self.storage
    }

    /// Returns the underlying fetcher.
    #[must_use]
    pub const fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Returns true once skip-waiting has been requested.
    #[must_use]
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::Acquire)
    }

    /// Returns true if installed and holding off activation.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.state == LifecycleState::Installed && !self.skip_waiting_requested()
    }

    /// Returns true once activation has claimed already-open clients.
    #[must_use]
    pub fn controls_clients(&self) -> bool {
        self.controls_clients.load(Ordering::Acquire)
    }

    fn url_for(&self, key: &str) -> String {
        key::url_for_key(&self.config.origin, key)
    }

    fn entry_key(&self, url: &str) -> Option<String> {
        key::entry_key(&self.config.origin, url)
    }

    // ------------------------------------------------------------------
    // Install
    // ------------------------------------------------------------------

    /// Fetches the core shell, bypassing HTTP caches, into the temp partition.
    ///
    /// Requests skip-waiting so activation can follow immediately. The shell
    /// is all-or-nothing: if any resource fails to fetch or comes back with a
    /// non-ok status, nothing is written and the instance becomes
    /// [`LifecycleState::Redundant`].
    ///
    /// Returns the number of staged resources.
    ///
    /// # Errors
    ///
    /// Returns the first fetch or storage error.
    pub async fn install(&mut self) -> Result<usize> {
        self.state = LifecycleState::Installing;
        self.skip_waiting.store(true, Ordering::Release);
        log::info!(
            "Installing {} ({} core resources)",
            self.id,
            self.deployment.core.len()
        );

        match self.stage_shell().await {
            Ok(staged) => {
                self.state = LifecycleState::Installed;
                log::info!("Installed {}: {staged} resources staged", self.id);
                Ok(staged)
            }
            Err(e) => {
                self.state = LifecycleState::Redundant;
                log::error!("Install of {} failed: {e}", self.id);
                Err(e)
            }
        }
    }

    async fn stage_shell(&self) -> Result<usize> {
        let temp = &self.config.partitions.temp;
        self.storage.open(temp).await?;

        let urls: Vec<String> = self.deployment.core.iter().map(|k| self.url_for(k)).collect();
        let responses = self.fetch_all(&urls, true, &NoProgress).await?;
        for (url, response) in &responses {
            self.storage.put(temp, url, response.clone()).await?;
        }
        Ok(responses.len())
    }

    /// Fetches every URL with bounded concurrency and returns the responses
    /// only if all of them succeeded with a cacheable status.
    async fn fetch_all(
        &self,
        urls: &[String],
        reload: bool,
        progress: &dyn FetchProgress,
    ) -> Result<Vec<(String, CachedResponse)>> {
        progress.on_start(urls.len());
        stream::iter(urls.iter().cloned())
            .map(|url| async move {
                let request = if reload {
                    FetchRequest::reload(url.as_str())
                } else {
                    FetchRequest::get(url.as_str())
                };
                let result = match self.fetcher.fetch(&request).await {
                    Ok(response) if response.is_cacheable() => Ok(response),
                    Ok(response) => Err(Error::Fetch {
                        url: url.clone(),
                        status: response.status,
                    }),
                    Err(e) => Err(e),
                };
                match &result {
                    Ok(response) => progress.on_fetched(&url, response.len() as u64),
                    Err(e) => progress.on_error(&url, &e.to_string()),
                }
                result.map(|response| (url, response))
            })
            .buffer_unordered(self.config.concurrent_fetches.max(1))
            .try_collect()
            .await
    }

    // ------------------------------------------------------------------
    // Activate
    // ------------------------------------------------------------------

    /// Promotes the staged shell into the content partition and records the
    /// new manifest.
    ///
    /// Never fails: if reconciliation hits an error, all three partitions
    /// are deleted and the returned report says so. Either way the instance
    /// is [`LifecycleState::Activated`] afterwards.
    pub async fn activate(&mut self) -> ActivationReport {
        if self.state != LifecycleState::Installed {
            log::warn!("Activating {} from state {:?}", self.id, self.state);
        }
        self.state = LifecycleState::Activating;
        let start = Instant::now();

        let mut report = match self.reconcile().await {
            Ok(report) => {
                self.controls_clients.store(true, Ordering::Release);
                log::info!(
                    "Activated {}: {:?}, {} promoted, {} retained, {} evicted",
                    self.id,
                    report.kind,
                    report.promoted,
                    report.retained.len(),
                    report.evicted.len()
                );
                report
            }
            Err(e) => {
                log::error!("Failed to upgrade cache for {}: {e}", self.id);
                self.wipe().await;
                ActivationReport::wiped(e.to_string())
            }
        };
        report.elapsed = start.elapsed();
        self.state = LifecycleState::Activated;
        report
    }

    async fn reconcile(&self) -> Result<ActivationReport> {
        let names = &self.config.partitions;
        self.storage.open(&names.content).await?;
        self.storage.open(&names.temp).await?;
        self.storage.open(&names.manifest).await?;

        let Some(stored) = self.storage.match_url(&names.manifest, MANIFEST_ENTRY).await? else {
            // Nothing to diff against; whatever is in content is of unknown vintage.
            self.storage.delete(&names.content).await?;
            self.storage.open(&names.content).await?;
            let promoted = self.promote_staged().await?;
            self.persist_manifest().await?;
            return Ok(ActivationReport::fresh(promoted));
        };
        let previous = ResourceManifest::from_json(&stored.body)?;
        let current = &self.deployment.resources;

        let mut evicted = Vec::new();
        let mut retained = Vec::new();
        for url in self.storage.keys(&names.content).await? {
            let unchanged = self
                .entry_key(&url)
                .is_some_and(|key| current.is_unchanged(&key, &previous));
            if unchanged {
                retained.push(url);
            } else {
                log::debug!("Evicting stale {url}");
                self.storage.remove(&names.content, &url).await?;
                evicted.push(url);
            }
        }

        let promoted = self.promote_staged().await?;
        self.persist_manifest().await?;
        Ok(ActivationReport::upgrade(evicted, retained, promoted))
    }

    /// Copies every temp entry into content, then deletes temp.
    async fn promote_staged(&self) -> Result<usize> {
        let names = &self.config.partitions;
        let staged = self.storage.keys(&names.temp).await?;
        for url in &staged {
            let Some(response) = self.storage.match_url(&names.temp, url).await? else {
                return Err(Error::Storage(format!("staged entry {url} disappeared")));
            };
            self.storage.put(&names.content, url, response).await?;
        }
        self.storage.delete(&names.temp).await?;
        Ok(staged.len())
    }

    async fn persist_manifest(&self) -> Result<()> {
        let entry = CachedResponse::json(MANIFEST_ENTRY, &self.deployment.resources)?;
        self.storage
            .put(&self.config.partitions.manifest, MANIFEST_ENTRY, entry)
            .await
    }

    /// Deletes all three partitions, logging rather than returning failures.
    async fn wipe(&self) {
        let names = &self.config.partitions;
        for partition in [&names.content, &names.temp, &names.manifest] {
            if let Err(e) = self.storage.delete(partition).await {
                log::error!("Failed to delete partition {partition}: {e}");
            }
        }
    }

    /// Creates the instance that will replace this one for a new deployment,
    /// sharing its configuration, storage and network.
    #[must_use]
    pub fn successor(&self, deployment: Deployment) -> Self
    where
        S: Clone,
        F: Clone,
    {
        Self::new(
            self.config.clone(),
            deployment,
            self.storage.clone(),
            self.fetcher.clone(),
        )
    }

    /// Resumes serving a version that was already activated by an earlier
    /// instance, without touching any partition.
    ///
    /// Returns true if the stored manifest equals this deployment's, in which
    /// case the instance is now [`LifecycleState::Activated`].
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest partition cannot be read.
    pub async fn resume(&mut self) -> Result<bool> {
        let current = self.stored_manifest().await? == Some(self.deployment.resources.clone());
        if current {
            self.state = LifecycleState::Activated;
            self.controls_clients.store(true, Ordering::Release);
            log::info!("Resumed {} against the stored manifest", self.id);
        }
        Ok(current)
    }

    /// Returns the manifest recorded by the last successful activation.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be read or parsed.
    pub async fn stored_manifest(&self) -> Result<Option<ResourceManifest>> {
        self.storage
            .match_url(&self.config.partitions.manifest, MANIFEST_ENTRY)
            .await?
            .map(|entry| ResourceManifest::from_json(&entry.body))
            .transpose()
    }

    // ------------------------------------------------------------------
    // Fetch
    // ------------------------------------------------------------------

    /// Handles a request from a controlled client.
    ///
    /// Non-GET requests, requests outside the origin and requests for
    /// resources not in the manifest are passed through without touching any
    /// partition. The root document is served online-first, everything else
    /// cache-first.
    ///
    /// # Errors
    ///
    /// Returns the network error when a resource is neither cached nor
    /// fetchable.
    pub async fn handle_fetch(&self, request: &FetchRequest) -> Result<FetchOutcome> {
        if !request.is_get() || self.state != LifecycleState::Activated {
            return Ok(FetchOutcome::Passthrough);
        }
        let origin = &self.config.origin;
        let Some(key) = key::request_key(origin, &request.url) else {
            return Ok(FetchOutcome::Passthrough);
        };
        if !self.deployment.resources.contains(&key) {
            log::trace!("Not in manifest, passing through: {}", request.url);
            return Ok(FetchOutcome::Passthrough);
        }

        // The network and the cache both see the URL without its fragment.
        let mut live = request.clone();
        live.url = key::storage_url(origin, &request.url);
        live.headers.retain(|(name, _)| {
            !VARIANT_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
        });
        let response = if key == ROOT_KEY {
            self.online_first(&live).await?
        } else {
            self.cache_first(&live).await?
        };
        Ok(FetchOutcome::Response(response))
    }

    async fn cache_first(&self, request: &FetchRequest) -> Result<CachedResponse> {
        let content = &self.config.partitions.content;
        let cache_url = request.url.as_str();
        if let Some(cached) = self.storage.match_url(content, cache_url).await? {
            log::trace!("Cache hit: {cache_url}");
            return Ok(cached);
        }

        let response = self.fetcher.fetch(request).await?;
        if response.is_cacheable() {
            self.store_content(cache_url, &response).await;
        }
        Ok(response)
    }

    async fn online_first(&self, request: &FetchRequest) -> Result<CachedResponse> {
        let cache_url = request.url.as_str();
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.is_cacheable() {
                    self.store_content(cache_url, &response).await;
                }
                Ok(response)
            }
            Err(network_error) => {
                let cached = self
                    .storage
                    .match_url(&self.config.partitions.content, cache_url)
                    .await;
                match cached {
                    Ok(Some(cached)) => {
                        log::info!("Offline, serving cached {cache_url}: {network_error}");
                        Ok(cached)
                    }
                    Ok(None) => Err(network_error),
                    Err(e) => {
                        log::warn!("Cache lookup for {cache_url} failed: {e}");
                        Err(network_error)
                    }
                }
            }
        }
    }

    /// Stores a copy of a live response. The caller gets the response
    /// regardless, so a failed write is only logged.
    async fn store_content(&self, cache_url: &str, response: &CachedResponse) {
        if let Err(e) = self
            .storage
            .put(&self.config.partitions.content, cache_url, response.clone())
            .await
        {
            log::warn!("Failed to cache {cache_url}: {e}");
        }
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Handles a control message posted by a client.
    ///
    /// # Errors
    ///
    /// Returns an error if an offline download fails.
    pub async fn handle_message(
        &self,
        message: &str,
        progress: &dyn FetchProgress,
    ) -> Result<MessageOutcome> {
        match message.parse::<ControlMessage>() {
            Ok(ControlMessage::SkipWaiting) => {
                self.skip_waiting.store(true, Ordering::Release);
                log::info!("Skip waiting requested for {}", self.id);
                Ok(MessageOutcome::SkipWaiting)
            }
            Ok(ControlMessage::DownloadOffline) => {
                let report = self.download_offline(progress).await?;
                Ok(MessageOutcome::Downloaded(report))
            }
            Err(e) => {
                log::warn!("Ignoring message: {e}");
                Ok(MessageOutcome::Ignored)
            }
        }
    }

    /// Fetches every manifest resource not yet in the content partition.
    ///
    /// Like the shell install this is all-or-nothing: responses are written
    /// only once every fetch has succeeded.
    ///
    /// # Errors
    ///
    /// Returns the first fetch or storage error.
    pub async fn download_offline(&self, progress: &dyn FetchProgress) -> Result<OfflineReport> {
        let start = Instant::now();
        let content = &self.config.partitions.content;
        let cached = self.cached_keys().await?;
        let missing: Vec<String> = self
            .deployment
            .resources
            .keys()
            .filter(|k| !cached.contains(*k))
            .map(|k| self.url_for(k))
            .collect();
        log::info!(
            "Downloading {} resources for offline use ({} already cached)",
            missing.len(),
            cached.len()
        );

        let responses = self.fetch_all(&missing, false, progress).await?;
        let mut bytes = 0;
        for (url, response) in responses {
            bytes += response.len() as u64;
            self.storage.put(content, &url, response).await?;
        }

        Ok(OfflineReport {
            already_cached: self.deployment.resources.len() - missing.len(),
            fetched: missing.len(),
            bytes,
            elapsed: start.elapsed(),
        })
    }

    async fn cached_keys(&self) -> Result<HashSet<String>> {
        Ok(self
            .storage
            .keys(&self.config.partitions.content)
            .await?
            .iter()
            .filter_map(|url| self.entry_key(url))
            .collect())
    }

    /// Summarizes the partitions relative to this deployment.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be read.
    pub async fn status(&self) -> Result<CacheStatus> {
        let cached = self.cached_keys().await?;
        let missing: Vec<String> = self
            .deployment
            .resources
            .keys()
            .filter(|k| !cached.contains(*k))
            .map(str::to_string)
            .collect();
        Ok(CacheStatus {
            partitions: self.storage.partitions().await?,
            cached: self.deployment.resources.len() - missing.len(),
            missing,
            manifest_current: self.stored_manifest().await?.as_ref()
                == Some(&self.deployment.resources),
            staged: self.storage.keys(&self.config.partitions.temp).await?.len(),
        })
    }
}

/// A lifecycle shared between a host's request handlers.
///
/// Install and activate take the write half, so they never overlap each
/// other or in-flight fetches; fetches and messages share the read half.
pub type SharedLifecycle<S, F> = Arc<tokio::sync::RwLock<CacheLifecycle<S, F>>>;
