//! HTTP front end: a caching reverse proxy in front of the origin.
//!
//! Every request is mapped onto the configured origin and offered to the
//! lifecycle's fetch handler. Requests it passes through are forwarded to the
//! origin as they are. Control endpoints live under `/__shellcache/`.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::CorsLayer;

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::fetch::{FetchRequest, Fetcher};
use crate::lifecycle::{
    CacheLifecycle, ControlMessage, FetchOutcome, LifecycleState, NoProgress, SharedLifecycle,
};
use crate::manifest::Deployment;
use crate::response::CachedResponse;
use crate::storage::CacheStorage;

/// Shared state for the proxy handlers.
pub struct ProxyState<S: CacheStorage, F: Fetcher> {
    lifecycle: SharedLifecycle<S, F>,
    deployment_path: Option<PathBuf>,
    updating: Arc<Mutex<()>>,
}

impl<S: CacheStorage, F: Fetcher> Clone for ProxyState<S, F> {
    fn clone(&self) -> Self {
        Self {
            lifecycle: Arc::clone(&self.lifecycle),
            deployment_path: self.deployment_path.clone(),
            updating: Arc::clone(&self.updating),
        }
    }
}

impl<S: CacheStorage, F: Fetcher> ProxyState<S, F> {
    /// Wraps a lifecycle. With a deployment path, `POST /__shellcache/update`
    /// reloads the deployment from it and installs it as a new version.
    #[must_use]
    pub fn new(lifecycle: CacheLifecycle<S, F>, deployment_path: Option<PathBuf>) -> Self {
        Self {
            lifecycle: Arc::new(RwLock::new(lifecycle)),
            deployment_path,
            updating: Arc::new(Mutex::new(())),
        }
    }

    /// Returns the shared lifecycle.
    #[must_use]
    pub fn lifecycle(&self) -> &SharedLifecycle<S, F> {
        &self.lifecycle
    }
}

/// Builds the proxy router.
pub fn router<S, F>(state: ProxyState<S, F>) -> Router
where
    S: CacheStorage + Clone + 'static,
    F: Fetcher + Clone + 'static,
{
    let control = Router::new()
        .route("/__shellcache/message", post(post_message::<S, F>))
        .route("/__shellcache/update", post(post_update::<S, F>))
        .route("/__shellcache/status", get(get_status::<S, F>))
        .layer(CorsLayer::permissive());

    Router::new()
        .merge(control)
        .fallback(proxy_request::<S, F>)
        .with_state(state)
}

/// Binds and serves the proxy until the process exits.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn serve<S, F>(state: ProxyState<S, F>, config: &ProxyConfig) -> Result<()>
where
    S: CacheStorage + Clone + 'static,
    F: Fetcher + Clone + 'static,
{
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Proxy listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn bad_gateway(e: &crate::Error) -> Response {
    (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
}

async fn proxy_request<S, F>(
    State(state): State<ProxyState<S, F>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response
where
    S: CacheStorage + 'static,
    F: Fetcher + 'static,
{
    let lifecycle = state.lifecycle.read().await;
    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let request = FetchRequest {
        method,
        url: format!("{}{path}", lifecycle.config().origin),
        reload: false,
        headers: header_pairs(&headers),
        body,
    };

    let result = match lifecycle.handle_fetch(&request).await {
        Ok(FetchOutcome::Response(response)) => Ok(response),
        Ok(FetchOutcome::Passthrough) => lifecycle.fetcher().fetch(&request).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(response) => response.into_response(),
        Err(e) => {
            log::warn!("{} {} failed: {e}", request.method, request.url);
            bad_gateway(&e)
        }
    }
}

async fn post_message<S, F>(State(state): State<ProxyState<S, F>>, body: String) -> Response
where
    S: CacheStorage + 'static,
    F: Fetcher + 'static,
{
    match body.trim().parse::<ControlMessage>() {
        Ok(ControlMessage::SkipWaiting) => {
            let mut lifecycle = state.lifecycle.write().await;
            if let Err(e) = lifecycle.handle_message("skipWaiting", &NoProgress).await {
                return bad_gateway(&e);
            }
            if lifecycle.state() == LifecycleState::Installed {
                lifecycle.activate().await;
            }
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(ControlMessage::DownloadOffline) => {
            let lifecycle = Arc::clone(&state.lifecycle);
            tokio::spawn(async move {
                let lifecycle = lifecycle.read().await;
                if let Err(e) = lifecycle.download_offline(&NoProgress).await {
                    log::error!("Offline download failed: {e}");
                }
            });
            StatusCode::ACCEPTED.into_response()
        }
        Err(e) => {
            log::warn!("Ignoring message: {e}");
            (StatusCode::BAD_REQUEST, e).into_response()
        }
    }
}

async fn post_update<S, F>(State(state): State<ProxyState<S, F>>) -> Response
where
    S: CacheStorage + Clone + 'static,
    F: Fetcher + Clone + 'static,
{
    // One update at a time; requests keep flowing through the current
    // instance until the successor is installed.
    let _updating = state.updating.lock().await;
    let deployment = match &state.deployment_path {
        Some(path) => match Deployment::load(path) {
            Ok(deployment) => deployment,
            Err(e) => return (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()).into_response(),
        },
        None => state.lifecycle.read().await.deployment().clone(),
    };

    let mut next = state.lifecycle.read().await.successor(deployment);
    if let Err(e) = next.install().await {
        return bad_gateway(&e);
    }

    let mut current = state.lifecycle.write().await;
    let report = next.activate().await;
    *current = next;
    drop(current);
    Json(serde_json::json!({
        "success": report.is_success(),
        "kind": format!("{:?}", report.kind),
        "promoted": report.promoted,
        "retained": report.retained.len(),
        "evicted": report.evicted.len(),
    }))
    .into_response()
}

async fn get_status<S, F>(State(state): State<ProxyState<S, F>>) -> Response
where
    S: CacheStorage + 'static,
    F: Fetcher + 'static,
{
    let lifecycle = state.lifecycle.read().await;
    match lifecycle.status().await {
        Ok(status) => Json(serde_json::json!({
            "instance": lifecycle.id().to_string(),
            "state": format!("{:?}", lifecycle.state()),
            "partitions": status.partitions,
            "cached": status.cached,
            "missing": status.missing.len(),
            "staged": status.staged,
            "manifest_current": status.manifest_current,
        }))
        .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

impl IntoResponse for CachedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::BAD_GATEWAY);
        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => log::debug!("Dropping unrepresentable header {name}"),
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use crate::config::CacheConfig;
    use crate::fetch::HttpFetcher;
    use crate::storage::MemoryStorage;

    const SLOW_ORIGIN: Duration = Duration::from_secs(2);

    /// Starts a tiny origin that serves a few static files and counts hits.
    /// While `slow` is set, `/main.dart.js` takes [`SLOW_ORIGIN`] to answer.
    async fn start_origin(hits: Arc<AtomicUsize>, slow: Arc<AtomicBool>) -> SocketAddr {
        let main_js = move || {
            let slow = Arc::clone(&slow);
            async move {
                if slow.load(Ordering::SeqCst) {
                    tokio::time::sleep(SLOW_ORIGIN).await;
                }
                "void main() {}"
            }
        };
        let app = Router::new()
            .route("/", get(|| async { "<html>shell</html>" }))
            .route("/main.dart.js", get(main_js))
            .route("/api/ping", get(|| async { "pong" }).post(|body: String| async move { body }))
            .layer(axum::middleware::from_fn(
                move |req: axum::extract::Request, next: axum::middleware::Next| {
                    let hits = Arc::clone(&hits);
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        next.run(req).await
                    }
                },
            ));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    async fn start_proxy(
        origin: SocketAddr,
        storage: Arc<MemoryStorage>,
    ) -> (SocketAddr, ProxyState<Arc<MemoryStorage>, HttpFetcher>) {
        let config = CacheConfig::new().with_origin(format!("http://{origin}"));
        let deployment = Deployment::new(
            [("/", "r1"), ("main.dart.js", "m1")].into_iter().collect(),
            vec!["main.dart.js".to_string()],
        )
        .unwrap();
        let fetcher = HttpFetcher::new(&config).unwrap();
        let mut lifecycle = CacheLifecycle::new(config, deployment, storage, fetcher);
        lifecycle.install().await.unwrap();
        lifecycle.activate().await;

        let state = ProxyState::new(lifecycle, None);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (addr, state)
    }

    #[tokio::test]
    async fn serves_shell_from_cache_after_activation() {
        let hits = Arc::new(AtomicUsize::new(0));
        let origin = start_origin(Arc::clone(&hits), Arc::default()).await;
        let (proxy, _) = start_proxy(origin, Arc::new(MemoryStorage::new())).await;
        let installed_hits = hits.load(Ordering::SeqCst);

        let body = reqwest::get(format!("http://{proxy}/main.dart.js"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "void main() {}");
        assert_eq!(hits.load(Ordering::SeqCst), installed_hits);
    }

    #[tokio::test]
    async fn root_goes_to_origin_and_is_cached() {
        let hits = Arc::new(AtomicUsize::new(0));
        let origin = start_origin(Arc::clone(&hits), Arc::default()).await;
        let storage = Arc::new(MemoryStorage::new());
        let (proxy, _) = start_proxy(origin, Arc::clone(&storage)).await;

        let response = reqwest::get(format!("http://{proxy}/")).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "<html>shell</html>");

        let cached = storage
            .match_url("flutter-app-cache", &format!("http://{origin}/"))
            .await
            .unwrap();
        assert!(cached.is_some());
    }

    #[tokio::test]
    async fn passthrough_is_forwarded_and_not_cached() {
        let hits = Arc::new(AtomicUsize::new(0));
        let origin = start_origin(Arc::clone(&hits), Arc::default()).await;
        let storage = Arc::new(MemoryStorage::new());
        let (proxy, _) = start_proxy(origin, Arc::clone(&storage)).await;
        let before = storage.keys("flutter-app-cache").await.unwrap();

        let client = reqwest::Client::new();
        let pong = client
            .get(format!("http://{proxy}/api/ping"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(pong, "pong");

        let echoed = client
            .post(format!("http://{proxy}/api/ping"))
            .body("hello")
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(echoed, "hello");

        assert_eq!(storage.keys("flutter-app-cache").await.unwrap(), before);
    }

    #[tokio::test]
    async fn control_messages() {
        let hits = Arc::new(AtomicUsize::new(0));
        let origin = start_origin(Arc::clone(&hits), Arc::default()).await;
        let (proxy, _) = start_proxy(origin, Arc::new(MemoryStorage::new())).await;
        let client = reqwest::Client::new();
        let url = format!("http://{proxy}/__shellcache/message");

        let skip = client.post(&url).body("skipWaiting").send().await.unwrap();
        assert_eq!(skip.status(), 204);

        let unknown = client.post(&url).body("reboot").send().await.unwrap();
        assert_eq!(unknown.status(), 400);

        let offline = client.post(&url).body("downloadOffline").send().await.unwrap();
        assert_eq!(offline.status(), 202);
    }

    #[tokio::test]
    async fn update_installs_a_successor() {
        let hits = Arc::new(AtomicUsize::new(0));
        let origin = start_origin(Arc::clone(&hits), Arc::default()).await;
        let (proxy, state) = start_proxy(origin, Arc::new(MemoryStorage::new())).await;
        let first = state.lifecycle().read().await.id();

        let response = reqwest::Client::new()
            .post(format!("http://{proxy}/__shellcache/update"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let report: serde_json::Value =
            serde_json::from_str(&response.text().await.unwrap()).unwrap();
        assert_eq!(report["success"], true);
        assert_eq!(report["kind"], "Upgrade");

        let lifecycle = state.lifecycle().read().await;
        assert_ne!(lifecycle.id(), first);
        assert_eq!(lifecycle.state(), LifecycleState::Activated);
    }

    #[tokio::test]
    async fn origin_down_is_bad_gateway() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let config = CacheConfig::new().with_origin(format!("http://{dead}"));
        let deployment = Deployment::new(
            [("/", "r1")].into_iter().collect(),
            vec![],
        )
        .unwrap();
        let fetcher = HttpFetcher::new(&config).unwrap();
        let mut lifecycle =
            CacheLifecycle::new(config, deployment, Arc::new(MemoryStorage::new()), fetcher);
        lifecycle.install().await.unwrap();
        lifecycle.activate().await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = listener.local_addr().unwrap();
        let app = router(ProxyState::new(lifecycle, None));
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let response = reqwest::get(format!("http://{proxy}/")).await.unwrap();
        assert_eq!(response.status(), 502);
    }

    #[tokio::test]
    async fn cached_requests_are_served_while_update_installs() {
        let hits = Arc::new(AtomicUsize::new(0));
        let slow = Arc::new(AtomicBool::new(false));
        let origin = start_origin(Arc::clone(&hits), Arc::clone(&slow)).await;
        let (proxy, state) = start_proxy(origin, Arc::new(MemoryStorage::new())).await;
        let first = state.lifecycle().read().await.id();
        slow.store(true, Ordering::SeqCst);

        let update = tokio::spawn(async move {
            reqwest::Client::new()
                .post(format!("http://{proxy}/__shellcache/update"))
                .send()
                .await
                .unwrap()
                .status()
        });
        // Give the successor time to start fetching the slow shell file.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        let body = reqwest::get(format!("http://{proxy}/main.dart.js"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "void main() {}");
        assert!(
            started.elapsed() < SLOW_ORIGIN / 2,
            "cache hit waited {:?} for the update",
            started.elapsed()
        );
        assert_eq!(state.lifecycle().read().await.id(), first);

        assert_eq!(update.await.unwrap(), 200);
        assert_ne!(state.lifecycle().read().await.id(), first);
    }
}
