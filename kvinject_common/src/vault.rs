//! A minimal Vault client which logs in using a Kubernetes service account
//! token and reads fields from the KV version 2 secrets engine.
//!
//! The client starts out unauthenticated. A successful call to
//! [`VaultClient::authenticate`] stores a session token, which every later
//! read uses until the process exits. Nothing is cached, renewed or revoked.

use std::{fs, io};

use reqwest::{blocking::Client, StatusCode};
use url::Url;

use crate::prelude::*;

/// The Kubernetes auth method's login endpoint, relative to the store
/// address.
const LOGIN_ENDPOINT: &str = "v1/auth/kubernetes/login";

/// The KV v2 read endpoint prefix, relative to the store address.
const SECRET_DATA_ENDPOINT: &str = "v1/secret/data/";

/// The header carrying our session token.
const TOKEN_HEADER: &str = "X-Vault-Token";

/// Errors returned by [`VaultClient`].
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// We could not read our identity token from disk.
    #[error("could not read identity token from {}", path.display())]
    IdentityRead {
        /// Where we looked for the token.
        path: PathBuf,
        /// Why we couldn't read it.
        #[source]
        source: io::Error,
    },

    /// The store address could not be parsed as a URL.
    #[error("invalid secret store address {address:?}")]
    InvalidAddress {
        /// The address we were given.
        address: String,
        /// The parse failure.
        #[source]
        source: url::ParseError,
    },

    /// Logging in failed.
    #[error("could not authenticate to secret store as role {role:?}")]
    Auth {
        /// The role we asked for.
        role: String,
        /// What went wrong.
        #[source]
        reason: AuthFailure,
    },

    /// A read was attempted before authenticating.
    #[error("not authenticated to the secret store")]
    NotAuthenticated,

    /// Reading a secret failed.
    #[error("could not fetch key {key:?} from secret path {path:?}")]
    Fetch {
        /// The secret path.
        path: String,
        /// The field within the path.
        key: String,
        /// What went wrong.
        #[source]
        reason: FetchFailure,
    },
}

impl VaultError {
    /// If this is a fetch error, why did it fail?
    pub fn fetch_failure(&self) -> Option<&FetchFailure> {
        match self {
            VaultError::Fetch { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// Why a login attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum AuthFailure {
    /// The HTTP request itself failed.
    #[error("login request failed")]
    Request(#[source] reqwest::Error),

    /// The store refused the login.
    #[error("login returned HTTP {0}")]
    Status(StatusCode),

    /// The response body wasn't what we expected.
    #[error("could not decode login response")]
    Decode(#[source] reqwest::Error),

    /// The store answered, but without a session token.
    #[error("login response contained no client token")]
    EmptyToken,
}

/// Why reading a secret failed.
#[derive(Debug, thiserror::Error)]
pub enum FetchFailure {
    /// The path has an empty, `.` or `..` segment.
    #[error("secret path is not a plain list of segments")]
    InvalidPath,

    /// The HTTP request itself failed.
    #[error("read request failed")]
    Request(#[source] reqwest::Error),

    /// The store returned an unexpected status.
    #[error("read returned HTTP {0}")]
    Status(StatusCode),

    /// The response body wasn't what we expected.
    #[error("could not decode read response")]
    Decode(#[source] reqwest::Error),

    /// There are no secrets at this path. Usually the path is wrong.
    #[error("no secrets were found at this path")]
    PathEmpty,

    /// The path holds secrets, but not this key. Usually the key is wrong.
    #[error("key not found at this path")]
    KeyMissing,
}

/// Body of a login request.
#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    role: &'a str,
    jwt: &'a str,
}

/// The parts of a login response we care about.
#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    auth: Option<LoginAuth>,
}

#[derive(Debug, Deserialize)]
struct LoginAuth {
    #[serde(default)]
    client_token: String,
}

/// The parts of a KV v2 read response we care about. The field map is
/// nested twice: once by the HTTP API, once by the KV engine.
#[derive(Debug, Deserialize)]
struct ReadResponse {
    #[serde(default)]
    data: Option<ReadData>,
}

#[derive(Debug, Deserialize)]
struct ReadData {
    #[serde(default)]
    data: Option<HashMap<String, serde_json::Value>>,
}

/// An authenticated session.
#[derive(Clone)]
struct Session {
    token: String,
    base_address: Url,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("base_address", &self.base_address.as_str())
            .finish()
    }
}

/// A client for our secret store.
#[derive(Debug)]
pub struct VaultClient {
    http: Client,
    session: Option<Session>,
}

impl VaultClient {
    /// Create a new, unauthenticated client.
    pub fn new() -> Self {
        VaultClient {
            http: Client::new(),
            session: None,
        }
    }

    /// Have we successfully logged in?
    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    /// Log in to the store at `address` as `role`, proving our identity with
    /// the token stored at `identity_token_path`.
    ///
    /// The identity token is read before any network traffic happens, so an
    /// unreadable token never results in a login attempt.
    #[instrument(level = "debug", skip(self))]
    pub fn authenticate(
        &mut self,
        identity_token_path: &Path,
        address: &str,
        role: &str,
    ) -> std::result::Result<(), VaultError> {
        let jwt = read_identity_token(identity_token_path)?;
        let base_address = parse_base_address(address)?;
        let auth_err = |reason| VaultError::Auth {
            role: role.to_owned(),
            reason,
        };

        let login_url =
            join(&base_address, LOGIN_ENDPOINT).map_err(|source| {
                VaultError::InvalidAddress {
                    address: address.to_owned(),
                    source,
                }
            })?;
        let resp = self
            .http
            .post(login_url)
            .json(&LoginRequest { role, jwt: &jwt })
            .send()
            .map_err(|err| auth_err(AuthFailure::Request(err)))?;
        if !resp.status().is_success() {
            return Err(auth_err(AuthFailure::Status(resp.status())));
        }
        let login = resp
            .json::<LoginResponse>()
            .map_err(|err| auth_err(AuthFailure::Decode(err)))?;

        // An empty token is a failed login, not a degenerate session.
        let token = login
            .auth
            .map(|auth| auth.client_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| auth_err(AuthFailure::EmptyToken))?;

        debug!("authenticated to {}", base_address);
        self.session = Some(Session {
            token,
            base_address,
        });
        Ok(())
    }

    /// Fetch the value of `key` stored at `path`.
    #[instrument(level = "debug", skip(self))]
    pub fn fetch_secret(
        &self,
        path: &str,
        key: &str,
    ) -> std::result::Result<String, VaultError> {
        let session = self.session.as_ref().ok_or(VaultError::NotAuthenticated)?;
        let fetch_err = |reason| VaultError::Fetch {
            path: path.to_owned(),
            key: key.to_owned(),
            reason,
        };

        let url = secret_data_url(&session.base_address, path)
            .ok_or_else(|| fetch_err(FetchFailure::InvalidPath))?;
        let resp = self
            .http
            .get(url)
            .header(TOKEN_HEADER, &session.token)
            .send()
            .map_err(|err| fetch_err(FetchFailure::Request(err)))?;
        match resp.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(fetch_err(FetchFailure::PathEmpty)),
            status => return Err(fetch_err(FetchFailure::Status(status))),
        }
        let read = resp
            .json::<ReadResponse>()
            .map_err(|err| fetch_err(FetchFailure::Decode(err)))?;

        let fields = read
            .data
            .and_then(|data| data.data)
            .unwrap_or_default();
        if fields.is_empty() {
            return Err(fetch_err(FetchFailure::PathEmpty));
        }
        match fields.get(key) {
            Some(serde_json::Value::String(value)) => Ok(value.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err(fetch_err(FetchFailure::KeyMissing)),
        }
    }
}

impl Default for VaultClient {
    fn default() -> Self {
        VaultClient::new()
    }
}

/// Read and trim our identity token.
fn read_identity_token(path: &Path) -> std::result::Result<String, VaultError> {
    let identity_err = |source| VaultError::IdentityRead {
        path: path.to_owned(),
        source,
    };
    let raw = fs::read_to_string(path).map_err(identity_err)?;
    let token = raw.trim();
    if token.is_empty() {
        return Err(identity_err(io::Error::new(
            io::ErrorKind::InvalidData,
            "identity token is empty",
        )));
    }
    Ok(token.to_owned())
}

/// Parse the store address, making sure it ends with `/` so that relative
/// endpoints are appended rather than replacing the last path segment.
fn parse_base_address(address: &str) -> std::result::Result<Url, VaultError> {
    let mut base = Url::parse(address).map_err(|source| VaultError::InvalidAddress {
        address: address.to_owned(),
        source,
    })?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base)
}

/// Build `<base>/v1/secret/data/<path>`, escaping each segment of `path` so
/// that `?`, `#` and `%` stay part of the secret's name. Returns `None` if
/// `path` contains an empty, `.` or `..` segment.
fn secret_data_url(base: &Url, path: &str) -> Option<Url> {
    let segments = path.trim_start_matches('/').split('/').collect::<Vec<_>>();
    if segments
        .iter()
        .any(|segment| segment.is_empty() || *segment == "." || *segment == "..")
    {
        return None;
    }
    let mut url = base.clone();
    url.path_segments_mut()
        .ok()?
        .pop_if_empty()
        .extend(SECRET_DATA_ENDPOINT.trim_end_matches('/').split('/'))
        .extend(segments);
    Some(url)
}

fn join(base: &Url, relative: &str) -> std::result::Result<Url, url::ParseError> {
    base.join(relative)
}

#[test]
fn base_address_keeps_path_prefix() {
    let base = parse_base_address("https://vault.example.com/proxy").unwrap();
    assert_eq!(
        join(&base, LOGIN_ENDPOINT).unwrap().as_str(),
        "https://vault.example.com/proxy/v1/auth/kubernetes/login",
    );
    let base = parse_base_address("http://vault:8200").unwrap();
    assert_eq!(
        secret_data_url(&base, "sql/app").unwrap().as_str(),
        "http://vault:8200/v1/secret/data/sql/app",
    );
    assert_eq!(
        secret_data_url(&base, "/sql/a#b?c").unwrap().as_str(),
        "http://vault:8200/v1/secret/data/sql/a%23b%3Fc",
    );
    assert!(secret_data_url(&base, "../../sys/seal").is_none());
    assert!(matches!(
        parse_base_address("not a url"),
        Err(VaultError::InvalidAddress { .. })
    ));
}

#[test]
fn identity_token_is_trimmed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("token");
    fs::write(&path, "  eyJhbGciOi.payload.sig\n").unwrap();
    assert_eq!(read_identity_token(&path).unwrap(), "eyJhbGciOi.payload.sig");

    fs::write(&path, " \n").unwrap();
    assert!(matches!(
        read_identity_token(&path),
        Err(VaultError::IdentityRead { .. })
    ));
}

#[test]
fn unauthenticated_client_refuses_to_fetch() {
    let client = VaultClient::new();
    assert!(!client.is_authenticated());
    assert!(matches!(
        client.fetch_secret("secret/sql", "password"),
        Err(VaultError::NotAuthenticated)
    ));
}

#[test]
fn session_debug_hides_token() {
    let session = Session {
        token: "s.supersecret".to_owned(),
        base_address: parse_base_address("http://vault:8200").unwrap(),
    };
    assert!(!format!("{:?}", session).contains("supersecret"));
}
