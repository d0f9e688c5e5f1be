//! Process-wide counters. These are registered once in `main` and handed to
//! request handlers through shared state.

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

/// Errors registering or exporting metrics.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// A counter could not be created or registered.
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    /// The registry could not be encoded as text.
    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Increment-only counters describing what the webhook has done.
#[derive(Clone)]
pub struct Metrics {
    errors: IntCounter,
    mutations: IntCounter,
}

impl Metrics {
    /// Create our counters and register them with `registry`.
    pub fn register(registry: &Registry) -> Result<Self, MetricsError> {
        let errors = IntCounter::new("kvinject_errors_total", "The total number of errors.")?;
        let mutations = IntCounter::new(
            "kvinject_mutations_total",
            "The total number of successful mutations.",
        )?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(mutations.clone()))?;
        Ok(Metrics { errors, mutations })
    }

    /// Record a failed request or a failed mutation.
    pub fn record_error(&self) {
        self.errors.inc();
    }

    /// Record a pod we successfully patched.
    pub fn record_mutation(&self) {
        self.mutations.inc();
    }

    /// The total number of errors so far.
    pub fn errors(&self) -> u64 {
        self.errors.get()
    }

    /// The total number of mutations so far.
    pub fn mutations(&self) -> u64 {
        self.mutations.get()
    }
}

/// Render everything in `registry` in the Prometheus text exposition format.
pub fn encode_text(registry: &Registry) -> Result<String, MetricsError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .map_err(|err| MetricsError::Encoding(err.to_string()))?;
    String::from_utf8(buffer).map_err(|err| MetricsError::Encoding(err.to_string()))
}

#[test]
fn counters_only_go_up() {
    let registry = Registry::new();
    let metrics = Metrics::register(&registry).unwrap();
    metrics.record_error();
    metrics.record_error();
    metrics.record_mutation();
    assert_eq!(metrics.errors(), 2);
    assert_eq!(metrics.mutations(), 1);

    let rendered = encode_text(&registry).unwrap();
    assert!(rendered.contains("kvinject_errors_total 2\n"));
    assert!(rendered.contains("# TYPE kvinject_mutations_total counter\n"));
    assert!(rendered.contains("kvinject_mutations_total 1\n"));
}

#[test]
fn registering_twice_fails() {
    let registry = Registry::new();
    Metrics::register(&registry).unwrap();
    assert!(matches!(
        Metrics::register(&registry),
        Err(MetricsError::Registration(_))
    ));
}
