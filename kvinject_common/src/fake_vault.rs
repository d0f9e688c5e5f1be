//! An in-process fake of the two Vault endpoints we use, served over real
//! HTTP on a loopback port. Only built with the `fake-vault` feature.

use std::{
    net::{SocketAddr, TcpListener},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};

use axum::{
    extract::{Path as UrlPath, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::prelude::*;

/// The session token handed out by a successful login.
pub const FAKE_CLIENT_TOKEN: &str = "s.fake-client-token";

/// What our fake store accepts and contains.
#[derive(Clone, Debug, Default)]
pub struct FakeVaultConfig {
    /// The role which may log in.
    pub role: String,
    /// The identity token which that role must present.
    pub jwt: String,
    /// Return an empty client token even for a valid login.
    pub empty_token: bool,
    /// Secret paths (without leading `/`) and their fields.
    pub secrets: BTreeMap<String, BTreeMap<String, String>>,
}

impl FakeVaultConfig {
    /// Create a store which lets `role` log in with `jwt`.
    pub fn new(role: &str, jwt: &str) -> Self {
        FakeVaultConfig {
            role: role.to_owned(),
            jwt: jwt.to_owned(),
            ..FakeVaultConfig::default()
        }
    }

    /// Store `value` under `key` at `path`.
    pub fn with_secret(mut self, path: &str, key: &str, value: &str) -> Self {
        self.secrets
            .entry(path.trim_start_matches('/').to_owned())
            .or_default()
            .insert(key.to_owned(), value.to_owned());
        self
    }

    /// Create `path` with no fields in it.
    pub fn with_empty_path(mut self, path: &str) -> Self {
        self.secrets
            .entry(path.trim_start_matches('/').to_owned())
            .or_default();
        self
    }
}

/// Shared state of a running fake.
#[derive(Debug, Default)]
struct FakeVaultState {
    config: FakeVaultConfig,
    logins: AtomicUsize,
    reads: AtomicUsize,
}

/// A running fake store. The server thread lives until the test process
/// exits.
pub struct FakeVault {
    addr: SocketAddr,
    state: Arc<FakeVaultState>,
}

impl FakeVault {
    /// Start serving `config` on an unused loopback port.
    pub fn start(config: FakeVaultConfig) -> FakeVault {
        let listener =
            TcpListener::bind("127.0.0.1:0").expect("could not bind fake vault");
        listener
            .set_nonblocking(true)
            .expect("could not make listener non-blocking");
        let addr = listener.local_addr().expect("listener has no address");
        let state = Arc::new(FakeVaultState {
            config,
            ..FakeVaultState::default()
        });

        let app = Router::new()
            .route("/v1/auth/kubernetes/login", post(login))
            .route("/v1/secret/data/*path", get(read))
            .with_state(state.clone());
        thread::Builder::new()
            .name("fake-vault".to_owned())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("could not build fake vault runtime");
                runtime.block_on(async move {
                    axum::Server::from_tcp(listener)
                        .expect("could not serve fake vault")
                        .serve(app.into_make_service())
                        .await
                        .expect("fake vault failed");
                });
            })
            .expect("could not spawn fake vault thread");

        FakeVault { addr, state }
    }

    /// The address to pass to [`crate::vault::VaultClient::authenticate`].
    pub fn address(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// How many login requests have we received?
    pub fn login_count(&self) -> usize {
        self.state.logins.load(Ordering::SeqCst)
    }

    /// How many read requests have we received?
    pub fn read_count(&self) -> usize {
        self.state.reads.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    role: String,
    jwt: String,
}

async fn login(
    State(state): State<Arc<FakeVaultState>>,
    Json(body): Json<LoginBody>,
) -> Response {
    state.logins.fetch_add(1, Ordering::SeqCst);
    let config = &state.config;
    if body.role != config.role || body.jwt != config.jwt {
        let errors = json!({ "errors": ["permission denied"] });
        return (StatusCode::FORBIDDEN, Json(errors)).into_response();
    }
    let token = if config.empty_token {
        ""
    } else {
        FAKE_CLIENT_TOKEN
    };
    Json(json!({ "auth": { "client_token": token } })).into_response()
}

async fn read(
    State(state): State<Arc<FakeVaultState>>,
    UrlPath(path): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    state.reads.fetch_add(1, Ordering::SeqCst);
    let authorized = headers
        .get("X-Vault-Token")
        .map(|token| token.as_bytes() == FAKE_CLIENT_TOKEN.as_bytes())
        .unwrap_or(false);
    if !authorized {
        let errors = json!({ "errors": ["permission denied"] });
        return (StatusCode::FORBIDDEN, Json(errors)).into_response();
    }
    match state.config.secrets.get(path.trim_start_matches('/')) {
        Some(fields) => Json(json!({ "data": { "data": fields } })).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({ "errors": [] }))).into_response(),
    }
}
