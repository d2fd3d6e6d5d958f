//! Reverse-proxy front-end: exposes a caching querier as a range server.
//!
//! Useful at the edge of a fleet: one proxy process absorbs the query
//! traffic of its neighbors, and its cache plus `%version` polling keep the
//! real range servers out of the hot path.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::Router;
use axum::extract::RawQuery;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use snafu::ResultExt;
use snafu::Snafu;
use tower_http::compression::CompressionLayer;
use tracing::error;
use tracing::info;
use url::form_urlencoded;

use crate::config::QuerierConfig;
use crate::config::new_querier;
use crate::config::Querier;
use crate::error::RangeError;

/// Process-wide count of proxied queries that failed to resolve.
static ERROR_COUNT: AtomicU64 = AtomicU64::new(0);

/// Total failed proxied queries since process start.
pub fn error_count() -> u64 {
    ERROR_COUNT.load(Ordering::Relaxed)
}

/// Configuration for the proxy server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Port to listen on.
    pub port: u16,
    /// Upstream range servers.
    pub servers: Vec<String>,
    /// `%version` heartbeat period for the backing cache. Zero disables.
    pub check_version_periodicity: Duration,
}

/// Errors from running the proxy.
#[derive(Debug, Snafu)]
pub enum ProxyError {
    /// The backing querier could not be constructed.
    #[snafu(display("cannot create querier: {source}"))]
    CreateQuerier { source: RangeError },

    /// The listen socket could not be bound.
    #[snafu(display("cannot bind port {port}: {source}"))]
    Bind { port: u16, source: std::io::Error },

    /// The server loop failed.
    #[snafu(display("proxy server failed: {source}"))]
    Serve { source: std::io::Error },
}

#[derive(Clone)]
struct ProxyState {
    querier: Arc<dyn Querier>,
}

/// Serve `GET /range/list` on the configured port, backed by a caching
/// querier that retries across every upstream server.
pub async fn serve(config: ProxyConfig) -> Result<(), ProxyError> {
    let querier = new_querier(QuerierConfig {
        retry_count: config.servers.len() as u32,
        servers: config.servers.clone(),
        check_version_periodicity: config.check_version_periodicity,
        ..QuerierConfig::default()
    })
    .context(CreateQuerierSnafu)?;

    let app = router(ProxyState {
        querier: Arc::from(querier),
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .context(BindSnafu { port: config.port })?;
    info!(port = config.port, servers = config.servers.len(), "range proxy listening");
    axum::serve(listener, app).await.context(ServeSnafu)
}

fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/range/list", get(list))
        .layer(CompressionLayer::new())
        .with_state(state)
}

/// `GET /range/list?<escaped expression>`. Lines are written CRLF-separated,
/// as range servers do.
async fn list(State(state): State<ProxyState>, RawQuery(query): RawQuery) -> Response {
    let Some(raw) = query else {
        return (StatusCode::BAD_REQUEST, "missing query expression\n").into_response();
    };
    let expression = match form_urlencoded::parse(raw.as_bytes()).next() {
        Some((decoded, _)) => decoded.into_owned(),
        None => {
            return (StatusCode::BAD_REQUEST, "cannot decode query\n").into_response();
        }
    };

    match state.querier.query(&expression).await {
        Ok(lines) => {
            let mut body = String::new();
            for line in &lines {
                body.push_str(line);
                body.push_str("\r\n");
            }
            body.into_response()
        }
        Err(err) => {
            ERROR_COUNT.fetch_add(1, Ordering::Relaxed);
            error!(expression = %expression, error = %err, "cannot resolve proxied query");
            (StatusCode::BAD_GATEWAY, format!("cannot resolve query: {err}\n")).into_response()
        }
    }
}
