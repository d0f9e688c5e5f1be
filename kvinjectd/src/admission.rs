//! The HTTP side of the webhook: decoding `AdmissionReview` envelopes,
//! deciding what to do with the pod inside, and encoding our answer.
//!
//! Malformed envelopes are rejected with a 4xx. Anything that goes wrong
//! after that point is a processing error, and the pod is admitted
//! unmodified unless it asked to be denied on failure.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use k8s_openapi::api::core::v1::Pod;
use kvinject_common::{prelude::*, serde_json};
use prometheus::Registry;

use crate::{
    config::InjectorConfig,
    decision::{self, MutationDecision},
    metrics::{self, Metrics, MetricsError},
    patch::build_patch,
};

/// The only content type we accept.
const JSON_CONTENT_TYPE: &str = "application/json";

/// The patch type Kubernetes expects alongside a patch.
const JSON_PATCH_TYPE: &str = "JSONPatch";

/// State shared by all requests. Everything here is either read-only or
/// safe to update concurrently.
pub struct AppState {
    /// How to build injected containers.
    pub injector: InjectorConfig,
    /// Counters.
    pub metrics: Metrics,
    /// Where `metrics` is registered.
    pub registry: Registry,
}

impl AppState {
    /// Create state, registering fresh counters with `registry`.
    pub fn new(injector: InjectorConfig, registry: Registry) -> Result<Self, MetricsError> {
        let metrics = Metrics::register(&registry)?;
        Ok(AppState {
            injector,
            metrics,
            registry,
        })
    }
}

/// Build the webhook routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/mutate", post(mutate))
        .with_state(state)
}

/// Build the routes for our separate metrics listener.
pub fn metrics_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/metrics", get(serve_metrics))
        .with_state(state)
}

/// An incoming `AdmissionReview`. We only look at the fields we need.
#[derive(Debug, Deserialize)]
pub struct AdmissionReview {
    /// The request, which Kubernetes always sends but which we can't assume.
    #[serde(default)]
    pub request: Option<AdmissionRequest>,
}

/// The request inside an `AdmissionReview`.
#[derive(Debug, Deserialize)]
pub struct AdmissionRequest {
    /// Identifies this request. Must be echoed back in our response.
    pub uid: String,
    /// The object being created.
    #[serde(default)]
    pub object: Option<serde_json::Value>,
}

/// An outgoing `AdmissionReview`.
#[derive(Debug, Serialize)]
pub struct AdmissionReviewResponse {
    /// Our answer.
    pub response: AdmissionResponse,
}

/// Our answer to a single admission request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    /// The `uid` of the request we're answering.
    pub uid: String,
    /// Should the object be admitted?
    pub allowed: bool,
    /// Always `JSONPatch` when `patch` is present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<&'static str>,
    /// Edits to apply to the object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<json_patch::Patch>,
    /// Why the object was denied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionStatus>,
}

/// An explanation attached to a denial.
#[derive(Debug, Serialize)]
pub struct AdmissionStatus {
    /// A human-readable message.
    pub message: String,
}

impl AdmissionResponse {
    /// Admit the object unchanged.
    fn allow(uid: &str) -> Self {
        AdmissionResponse {
            uid: uid.to_owned(),
            allowed: true,
            patch_type: None,
            patch: None,
            status: None,
        }
    }

    /// Admit the object with `patch` applied.
    fn with_patch(uid: &str, patch: Vec<json_patch::PatchOperation>) -> Self {
        AdmissionResponse {
            patch_type: Some(JSON_PATCH_TYPE),
            patch: Some(json_patch::Patch(patch)),
            ..AdmissionResponse::allow(uid)
        }
    }

    /// Reject the object.
    fn deny(uid: &str, message: String) -> Self {
        AdmissionResponse {
            allowed: false,
            status: Some(AdmissionStatus { message }),
            ..AdmissionResponse::allow(uid)
        }
    }
}

/// Ways an incoming request can be malformed. These are always reported to
/// the caller as a 4xx.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// There was no body.
    #[error("the request body is empty")]
    EmptyBody,

    /// The body wasn't labelled as JSON.
    #[error("invalid content-type")]
    InvalidContentType,

    /// The body couldn't be decoded as an `AdmissionReview`.
    #[error("could not decode admission review: {0}")]
    InvalidReview(#[source] serde_json::Error),

    /// The envelope contained no request.
    #[error("no admission review in request")]
    MissingRequest,

    /// The object under review isn't a pod.
    #[error("could not decode object as a pod: {0}")]
    InvalidObject(#[source] serde_json::Error),
}

impl ProtocolError {
    fn status_code(&self) -> StatusCode {
        match self {
            ProtocolError::InvalidContentType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ProtocolError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

/// Handle `POST /mutate`.
async fn mutate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match review(&state, &headers, &body) {
        Ok(response) => Json(AdmissionReviewResponse { response }).into_response(),
        Err(err) => {
            error!("rejecting admission request: {}", err);
            state.metrics.record_error();
            err.into_response()
        }
    }
}

/// Handle `GET /metrics`.
async fn serve_metrics(State(state): State<Arc<AppState>>) -> Response {
    match metrics::encode_text(&state.registry) {
        Ok(text) => text.into_response(),
        Err(err) => {
            error!("could not export metrics: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

/// Decode an admission request and decide how to answer it.
fn review(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> std::result::Result<AdmissionResponse, ProtocolError> {
    if body.is_empty() {
        return Err(ProtocolError::EmptyBody);
    }
    let content_type = headers.get(CONTENT_TYPE).map(|value| value.as_bytes());
    if content_type != Some(JSON_CONTENT_TYPE.as_bytes()) {
        return Err(ProtocolError::InvalidContentType);
    }
    let review = serde_json::from_slice::<AdmissionReview>(body)
        .map_err(ProtocolError::InvalidReview)?;
    let request = review.request.ok_or(ProtocolError::MissingRequest)?;
    let object = request.object.unwrap_or(serde_json::Value::Null);
    let pod = serde_json::from_value::<Pod>(object).map_err(ProtocolError::InvalidObject)?;
    Ok(respond(state, &request.uid, &pod))
}

/// Decide what to do with a decoded pod. Never fails: processing errors
/// become either an unmodified admission or a denial.
#[instrument(level = "debug", skip(state, pod), fields(pod_name = ?pod.metadata.name))]
fn respond(state: &AppState, uid: &str, pod: &Pod) -> AdmissionResponse {
    let empty = decision::Annotations::new();
    let annotations = pod.metadata.annotations.as_ref().unwrap_or(&empty);

    // Pods which didn't ask for injection are never affected by the deny policy.
    let decided = match decision::decide(annotations) {
        Ok(MutationDecision::Disabled) => {
            debug!(uid, "injection not requested");
            return AdmissionResponse::allow(uid);
        }
        Ok(MutationDecision::Enabled(injection)) => Ok(injection),
        Err(err) => Err(err),
    };

    let deny_on_failure = decision::deny_on_failure(annotations).unwrap_or_else(|err| {
        warn!(uid, "ignoring deny-on-failure policy: {}", err);
        state.metrics.record_error();
        false
    });
    let fail = |kind: &str, message: String| {
        error!(uid, kind, "could not mutate pod: {}", message);
        state.metrics.record_error();
        if deny_on_failure {
            AdmissionResponse::deny(uid, message)
        } else {
            AdmissionResponse::allow(uid)
        }
    };

    let injection = match decided {
        Ok(injection) => injection,
        Err(err) => return fail("annotation", err.to_string()),
    };

    match build_patch(pod, &injection, &state.injector) {
        Ok(patch) => {
            info!(uid, role = %injection.role, "injecting secrets");
            state.metrics.record_mutation();
            AdmissionResponse::with_patch(uid, patch)
        }
        Err(err) => fail("patch", format!("could not build patch: {}", err)),
    }
}
