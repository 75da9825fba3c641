//! # Key API, Healthcheck & metrics
//!
//! This crate provides the http api for the key pool along with healthcheck,
//! diagnostics, and metrics. It exposes the following endpoints:
//!
//! POST   /keys                 create a key
//! GET    /keys                 lease any free key
//! GET    /keys/:id             key state and remaining lifetime
//! POST   /keys/:id/unblock     release a lease
//! DELETE /keys/:id             remove a key
//! POST   /keys/:id/keep-alive  extend a key's lifetime
//! /health
//! /ping
//! /metrics
//! /metrics-text
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity, clippy::too_many_arguments)]

use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{Router, extract::Extension, routing};
use key_store::{Clock, KeyStore, SystemClock};
use lease_manager::LeaseManager;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, trace};

pub use crate::models::{Health, State};

/// The task runner for the [`ExternalApi`]
///
/// [`ExternalAPI`]: crate::ExternalApi
#[derive(Debug)]
pub struct ExternalApiGuard {
    task_handle: JoinHandle<()>,
}

impl Drop for ExternalApiGuard {
    fn drop(&mut self) {
        trace!("ExternalApiRunner drop called");
        self.task_handle.abort();
    }
}

/// Serves the key pool over HTTP and reports the health of the running
/// system
#[derive(Debug)]
pub struct ExternalApi<S, C = SystemClock> {
    tx: mpsc::Sender<Health>,
    rx: mpsc::Receiver<Health>,
    addr: SocketAddr,
    state: State,
    manager: Arc<LeaseManager<S, C>>,
}

impl<S, C> ExternalApi<S, C>
where
    S: KeyStore,
    C: Clock,
{
    /// Create a new ExternalApi instance
    pub fn new(addr: SocketAddr, manager: Arc<LeaseManager<S, C>>) -> Self {
        trace!("starting external api");
        let (tx, rx) = mpsc::channel(10);
        let state = models::blank_health();
        Self {
            tx,
            rx,
            addr,
            state,
            manager,
        }
    }

    /// clone the health sender channel
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.tx.clone()
    }

    /// Set the health
    pub async fn set_health(&self, health: Health) {
        *self.state.lock() = health;
    }

    /// Listen to Health changes over the channel
    async fn listen_status(&mut self) -> Result<()> {
        while let Some(health) = self.rx.recv().await {
            let mut guard = self.state.lock();
            if *guard != health {
                info!(%health, "health changed");
                *guard = health;
            }
        }
        info!("listen health exited-- nothing listening");
        Ok(())
    }

    /// the api routes, without any listener attached
    pub fn router(state: State, manager: Arc<LeaseManager<S, C>>) -> Router {
        Router::new()
            .route(
                "/keys",
                routing::post(handlers::create_key::<S, C>).get(handlers::acquire_key::<S, C>),
            )
            .route(
                "/keys/:id",
                routing::get(handlers::key_info::<S, C>).delete(handlers::delete_key::<S, C>),
            )
            .route("/keys/:id/unblock", routing::post(handlers::unblock::<S, C>))
            .route(
                "/keys/:id/keep-alive",
                routing::post(handlers::keep_alive::<S, C>),
            )
            .route("/health", routing::get(handlers::ok))
            .route("/ping", routing::get(handlers::ping))
            .route("/metrics", routing::get(handlers::metrics))
            .route("/metrics-text", routing::get(handlers::metrics_text))
            .layer(TraceLayer::new_for_http())
            .layer(Extension(state))
            .layer(Extension(manager))
    }

    /// serve the HTTP external api until `token` is cancelled
    async fn run(
        addr: SocketAddr,
        state: State,
        manager: Arc<LeaseManager<S, C>>,
        token: CancellationToken,
    ) -> Result<()> {
        let tcp = TcpListener::bind(&addr).await?;
        let app = Self::router(state, manager);

        debug!("external API listening on {}", addr);

        axum::serve(tcp, app)
            .with_graceful_shutdown(token.cancelled_owned())
            .await?;
        debug!("external API shut down");
        Ok(())
    }

    /// Kick off the HTTP service and start listening on all channels for
    /// changes. The task ends once `token` is cancelled.
    pub fn start(mut self, token: CancellationToken) -> JoinHandle<()> {
        let state = self.state.clone();
        let addr = self.addr;
        let manager = self.manager.clone();
        // if tx is not cloned, health listen will never update since ExternalApi is owner

        tokio::spawn(async move {
            tokio::select! {
                res = ExternalApi::run(addr, state, manager, token) => {
                    if let Err(err) = res {
                        error!(?err, "external API returned an error");
                    }
                }
                res = self.listen_status() => {
                    if let Err(err) = res {
                        error!(?err, "health task returning, this should not happen");
                    }
                }
            }
        })
    }

    /// Start the `ExternalApiRunner`
    pub fn serve(self, token: CancellationToken) -> ExternalApiGuard {
        ExternalApiGuard {
            task_handle: self.start(token),
        }
    }
}

mod handlers {

    use std::sync::Arc;

    use axum::{
        Json,
        body::Body,
        extract::{Extension, Path},
        http::header,
        http::{Response, StatusCode},
        response::IntoResponse,
    };
    use key_store::{Clock, KeyStore};
    use keylease_core::metrics::{START_TIME, UPTIME};
    use lease_manager::LeaseManager;
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use tracing::error;

    use crate::models::{Health, KeyResponse, Message, ServerError, ServerResult, State};

    type Manager<S, C> = Extension<Arc<LeaseManager<S, C>>>;

    pub(crate) async fn ok(Extension(state): Extension<State>) -> ServerResult<impl IntoResponse> {
        Ok(match *state.lock() {
            Health::Good => StatusCode::OK,
            Health::Bad => StatusCode::INTERNAL_SERVER_ERROR,
        })
    }

    pub(crate) async fn create_key<S: KeyStore, C: Clock>(
        Extension(mgr): Manager<S, C>,
    ) -> ServerResult<impl IntoResponse> {
        let key = mgr.create_key().await.map_err(ServerError::lease)?;
        Ok((StatusCode::CREATED, Json(KeyResponse { key })))
    }

    pub(crate) async fn acquire_key<S: KeyStore, C: Clock>(
        Extension(mgr): Manager<S, C>,
    ) -> ServerResult<impl IntoResponse> {
        let key = mgr.acquire_any().await.map_err(ServerError::lease)?;
        Ok(Json(KeyResponse { key }))
    }

    pub(crate) async fn key_info<S: KeyStore, C: Clock>(
        Extension(mgr): Manager<S, C>,
        Path(id): Path<String>,
    ) -> ServerResult<impl IntoResponse> {
        let info = mgr.get_info(&id).await.map_err(ServerError::lease)?;
        Ok(Json(info))
    }

    pub(crate) async fn unblock<S: KeyStore, C: Clock>(
        Extension(mgr): Manager<S, C>,
        Path(id): Path<String>,
    ) -> ServerResult<impl IntoResponse> {
        mgr.force_unblock(&id).await.map_err(ServerError::lease)?;
        Ok(Json(Message::new("key unblocked")))
    }

    pub(crate) async fn delete_key<S: KeyStore, C: Clock>(
        Extension(mgr): Manager<S, C>,
        Path(id): Path<String>,
    ) -> ServerResult<impl IntoResponse> {
        mgr.delete(&id).await.map_err(ServerError::lease)?;
        Ok(Json(Message::new("key deleted")))
    }

    pub(crate) async fn keep_alive<S: KeyStore, C: Clock>(
        Extension(mgr): Manager<S, C>,
        Path(id): Path<String>,
    ) -> ServerResult<impl IntoResponse> {
        mgr.keep_alive(&id).await.map_err(ServerError::lease)?;
        Ok(Json(Message::new("key is alive")))
    }

    pub(crate) async fn metrics() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = ProtobufEncoder::new();
        let mut buf = Vec::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error protobuf encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn metrics_text() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode_utf8(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn ping() -> impl IntoResponse {
        StatusCode::OK
    }
}

/// Various models for API responses
pub mod models {
    use axum::{Json, http::StatusCode, response::IntoResponse};
    use lease_manager::LeaseError;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::{fmt, sync::Arc};
    use tracing::warn;

    /// The overall health of the system
    pub type State = Arc<Mutex<Health>>;
    /// Health is binary Good/Bad at the moment
    #[derive(Serialize, Deserialize, Debug, PartialEq, Copy, Clone, Eq)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Health {
        /// Report good health
        Good,
        /// Report bad health
        Bad,
    }

    impl fmt::Display for Health {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}",
                match *self {
                    Health::Good => "GOOD",
                    Health::Bad => "BAD",
                }
            )
        }
    }

    pub(crate) fn blank_health() -> State {
        Arc::new(Mutex::new(Health::Bad))
    }

    /// body of create & acquire responses
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct KeyResponse {
        /// key identifier
        pub key: String,
    }

    /// body of responses that only confirm an action
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct Message {
        /// what happened
        pub message: String,
    }

    impl Message {
        pub(crate) fn new(message: &str) -> Self {
            Self {
                message: message.to_owned(),
            }
        }
    }

    /// body of every error response
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct ErrorDetail {
        /// human readable reason
        pub detail: String,
    }

    // error type
    /// Make our own error that wraps `anyhow::Error` along with the status
    /// to answer with.
    #[derive(Debug)]
    pub struct ServerError {
        status: StatusCode,
        err: anyhow::Error,
    }
    /// return error result
    pub type ServerResult<T> = Result<T, ServerError>;

    impl ServerError {
        /// map a lease failure onto the status callers see
        pub fn lease<E>(err: LeaseError<E>) -> Self
        where
            E: std::error::Error + Send + Sync + 'static,
        {
            let status = if err.is_not_found() {
                StatusCode::NOT_FOUND
            } else if err.is_retryable() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            Self {
                status,
                err: err.into(),
            }
        }

        /// status code this error answers with
        pub fn status(&self) -> StatusCode {
            self.status
        }
    }

    impl IntoResponse for ServerError {
        fn into_response(self) -> axum::response::Response {
            let detail = if self.status == StatusCode::NOT_FOUND {
                "Key not found".to_owned()
            } else {
                warn!(err = ?self.err, status = %self.status, "request failed");
                format!("{}", self.err)
            };
            (self.status, Json(ErrorDetail { detail })).into_response()
        }
    }

    impl<E> From<E> for ServerError
    where
        E: Into<anyhow::Error>,
    {
        fn from(err: E) -> Self {
            Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                err: err.into(),
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use key_store::FakeClock;
    use key_store::memory::MemoryStore;
    use lease_manager::LeaseConfig;
    use reqwest::StatusCode;
    use serde_json::Value;

    use super::*;
    use crate::models::{ErrorDetail, KeyResponse, Message};

    type Manager = LeaseManager<MemoryStore<FakeClock>, FakeClock>;

    fn manager() -> (Arc<Manager>, FakeClock) {
        let clock = FakeClock::new();
        let store = MemoryStore::with_clock(clock.clone());
        (
            Arc::new(LeaseManager::with_clock(
                store,
                LeaseConfig::default(),
                clock.clone(),
            )),
            clock,
        )
    }

    async fn serve(port: u16, mgr: Arc<Manager>) -> (ExternalApiGuard, CancellationToken) {
        let token = CancellationToken::new();
        let api = ExternalApi::new(SocketAddr::from(([127, 0, 0, 1], port)), mgr);
        let handle = api.serve(token.clone());
        // wait for server to come up
        tokio::time::sleep(Duration::from_secs(1)).await;
        (handle, token)
    }

    #[tokio::test]
    async fn test_health() -> anyhow::Result<()> {
        let (mgr, _clock) = manager();
        let api = ExternalApi::new("127.0.0.1:8889".parse().unwrap(), mgr);
        let sender = api.sender();
        let _handle = api.serve(CancellationToken::new());
        // wait for server to come up
        tokio::time::sleep(Duration::from_secs(1)).await;
        // initial health state will be BAD i.e. 500
        let r = reqwest::get("http://127.0.0.1:8889/health").await?;
        assert_eq!(r.status(), StatusCode::INTERNAL_SERVER_ERROR);

        sender.send(Health::Good).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let r = reqwest::get("http://127.0.0.1:8889/health").await?;
        assert_eq!(r.status(), StatusCode::OK);

        let r = reqwest::get("http://127.0.0.1:8889/ping").await?;
        assert_eq!(r.status(), StatusCode::OK);
        Ok(())
    }

    // very simple test for existence of metrics endpoint
    #[tokio::test]
    async fn test_metrics() -> anyhow::Result<()> {
        let (mgr, _clock) = manager();
        let (_handle, _token) = serve(8888, mgr).await;
        let bytes = reqwest::get("http://127.0.0.1:8888/metrics")
            .await?
            .error_for_status()?
            .bytes()
            .await;
        assert!(bytes.is_ok());

        let text = reqwest::get("http://127.0.0.1:8888/metrics-text")
            .await?
            .error_for_status()?
            .text()
            .await?;
        assert!(text.contains("uptime"));
        Ok(())
    }

    #[tokio::test]
    async fn test_key_lifecycle() -> anyhow::Result<()> {
        let (mgr, _clock) = manager();
        let (_handle, _token) = serve(8887, mgr).await;
        let base = "http://127.0.0.1:8887";
        let client = reqwest::Client::new();

        let r = client.post(format!("{base}/keys")).send().await?;
        assert_eq!(r.status(), StatusCode::CREATED);
        let KeyResponse { key } = r.json().await?;

        let r = client.get(format!("{base}/keys")).send().await?;
        assert_eq!(r.status(), StatusCode::OK);
        let leased: KeyResponse = r.json().await?;
        assert_eq!(leased.key, key);

        let info: Value = client
            .get(format!("{base}/keys/{key}"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(info["key"], key.as_str());
        assert_eq!(info["is_leased"], true);
        assert_eq!(info["ttl_remaining"], 300);

        // pool is empty now
        let r = client.get(format!("{base}/keys")).send().await?;
        assert_eq!(r.status(), StatusCode::NOT_FOUND);
        let detail: ErrorDetail = r.json().await?;
        assert_eq!(detail.detail, "Key not found");

        let r = client
            .post(format!("{base}/keys/{key}/unblock"))
            .send()
            .await?;
        assert_eq!(r.status(), StatusCode::OK);
        assert_eq!(r.json::<Message>().await?.message, "key unblocked");

        let r = client
            .post(format!("{base}/keys/{key}/keep-alive"))
            .send()
            .await?;
        assert_eq!(r.status(), StatusCode::OK);
        assert_eq!(r.json::<Message>().await?.message, "key is alive");
        let info: Value = client
            .get(format!("{base}/keys/{key}"))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(info["is_leased"], false);
        assert_eq!(info["ttl_remaining"], 600);

        let r = client.delete(format!("{base}/keys/{key}")).send().await?;
        assert_eq!(r.status(), StatusCode::OK);
        assert_eq!(r.json::<Message>().await?.message, "key deleted");

        for r in [
            client.get(format!("{base}/keys/{key}")).send().await?,
            client.delete(format!("{base}/keys/{key}")).send().await?,
            client
                .post(format!("{base}/keys/{key}/unblock"))
                .send()
                .await?,
            client
                .post(format!("{base}/keys/{key}/keep-alive"))
                .send()
                .await?,
        ] {
            assert_eq!(r.status(), StatusCode::NOT_FOUND);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_store_outage_is_503() -> anyhow::Result<()> {
        let (mgr, _clock) = manager();
        mgr.store().set_unavailable(true);
        let (_handle, _token) = serve(8886, mgr).await;

        let r = reqwest::Client::new()
            .post("http://127.0.0.1:8886/keys")
            .send()
            .await?;
        assert_eq!(r.status(), StatusCode::SERVICE_UNAVAILABLE);
        let detail: ErrorDetail = r.json().await?;
        assert!(detail.detail.contains("unavailable"));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_stops_server() -> anyhow::Result<()> {
        let (mgr, _clock) = manager();
        let token = CancellationToken::new();
        let task = ExternalApi::new("127.0.0.1:8885".parse().unwrap(), mgr).start(token.clone());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!task.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await??;
        Ok(())
    }
}
