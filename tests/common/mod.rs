//! A programmable in-process range server for integration tests.
//!
//! Each instance binds an ephemeral port and records every request it
//! serves. Responses come from, in order of precedence: the per-expression
//! table, the scripted FIFO queue, then the default response. `%version`
//! is answered from its own slot so heartbeat traffic does not consume the
//! script.

#![allow(dead_code)]

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::RawQuery;
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use tokio::net::TcpListener;
use url::form_urlencoded;

/// One canned response.
#[derive(Debug, Clone)]
pub struct Canned {
    pub status: u16,
    pub range_exception: Option<String>,
    pub body: String,
    pub delay: Duration,
}

impl Canned {
    pub fn ok(body: &str) -> Self {
        Self {
            status: 200,
            range_exception: None,
            body: body.to_string(),
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            range_exception: None,
            body: String::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn range_exception(message: &str) -> Self {
        Self {
            status: 200,
            range_exception: Some(message.to_string()),
            body: String::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn slow(body: &str, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::ok(body)
        }
    }
}

impl Default for Canned {
    fn default() -> Self {
        Self::ok("")
    }
}

/// One request the server saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub method: String,
    pub expression: String,
}

#[derive(Default)]
struct ServerState {
    by_expression: Mutex<HashMap<String, Canned>>,
    scripted: Mutex<VecDeque<Canned>>,
    fallback: Mutex<Canned>,
    version: Mutex<Option<i64>>,
    requests: Mutex<Vec<Received>>,
}

pub struct MockRangeServer {
    /// `127.0.0.1:<port>`, ready to drop into a server list.
    pub addr: String,
    state: Arc<ServerState>,
}

impl MockRangeServer {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());
        let app = Router::new()
            .route("/range/list", get(handle_get).put(handle_put))
            .with_state(Arc::clone(&state));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock range server");
        let addr = listener.local_addr().expect("mock server address").to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock range server");
        });
        Self { addr, state }
    }

    /// Answer every otherwise-unscripted request with `canned`.
    pub fn set_fallback(&self, canned: Canned) {
        *self.state.fallback.lock().unwrap() = canned;
    }

    /// Queue `canned` to answer the next unmatched request.
    pub fn push(&self, canned: Canned) {
        self.state.scripted.lock().unwrap().push_back(canned);
    }

    /// Always answer `expression` with `canned`.
    pub fn respond_to(&self, expression: &str, canned: Canned) {
        self.state
            .by_expression
            .lock()
            .unwrap()
            .insert(expression.to_string(), canned);
    }

    /// Answer `%version` queries with `version`.
    pub fn set_version(&self, version: i64) {
        *self.state.version.lock().unwrap() = Some(version);
    }

    pub fn requests(&self) -> Vec<Received> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }

    pub fn count_for(&self, expression: &str) -> usize {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.expression == expression)
            .count()
    }
}

fn decode_expression(raw: &str) -> String {
    form_urlencoded::parse(raw.as_bytes())
        .next()
        .map(|(decoded, _)| decoded.into_owned())
        .unwrap_or_default()
}

async fn handle_get(State(state): State<Arc<ServerState>>, RawQuery(query): RawQuery) -> Response {
    let expression = decode_expression(query.as_deref().unwrap_or_default());
    respond(&state, "GET", expression).await
}

async fn handle_put(State(state): State<Arc<ServerState>>, body: String) -> Response {
    let expression = form_urlencoded::parse(body.as_bytes())
        .find(|(key, _)| key == "query")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default();
    respond(&state, "PUT", expression).await
}

async fn respond(state: &ServerState, method: &str, expression: String) -> Response {
    state.requests.lock().unwrap().push(Received {
        method: method.to_string(),
        expression: expression.clone(),
    });

    let canned = if expression == "%version"
        && let Some(version) = *state.version.lock().unwrap()
    {
        Canned::ok(&format!("{version}\n"))
    } else if let Some(canned) = state.by_expression.lock().unwrap().get(&expression) {
        canned.clone()
    } else if let Some(canned) = state.scripted.lock().unwrap().pop_front() {
        canned
    } else {
        state.fallback.lock().unwrap().clone()
    };

    if canned.delay > Duration::ZERO {
        tokio::time::sleep(canned.delay).await;
    }

    let mut builder = Response::builder().status(canned.status);
    if let Some(message) = canned.range_exception {
        builder = builder.header("RangeException", message);
    }
    builder.body(Body::from(canned.body)).expect("mock response")
}
