//! Deciding, from a pod's annotations, whether and how to inject secrets.
//!
//! Raw annotations are only ever read here. Everything downstream works with
//! the validated [`MutationDecision`].

use std::collections::BTreeMap;

/// Set to a boolean to turn injection on or off.
pub const ENABLED_ANNOTATION: &str = "vault-inject.io/enabled";

/// The Vault role the pod authenticates as. Required when enabled.
pub const ROLE_ANNOTATION: &str = "vault-inject.io/role";

/// Overrides the default Vault address.
pub const ADDRESS_ANNOTATION: &str = "vault-inject.io/address";

/// Set to a boolean to reject the pod, instead of admitting it unmodified,
/// when injection fails.
pub const DENY_ANNOTATION: &str = "vault-inject.io/deny";

/// Pod annotations, as they appear in `metadata.annotations`.
pub type Annotations = BTreeMap<String, String>;

/// Problems with a pod's annotations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AnnotationError {
    /// A boolean annotation had some other value.
    #[error("annotation {key} must be a boolean, found {value:?}")]
    InvalidBool {
        /// The annotation key.
        key: &'static str,
        /// The value we found.
        value: String,
    },

    /// Injection was enabled without saying which role to use.
    #[error("annotation {} is required when {} is true", ROLE_ANNOTATION, ENABLED_ANNOTATION)]
    RoleRequired,
}

/// How to inject secrets into a pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Injection {
    /// The Vault role to authenticate as. Never empty.
    pub role: String,
    /// The Vault address from the pod's annotations, if it overrides ours.
    pub store_address: Option<String>,
}

impl Injection {
    /// The Vault address to use, falling back to `default` when the pod
    /// doesn't specify one.
    pub fn store_address_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.store_address.as_deref().unwrap_or(default)
    }
}

/// Whether to mutate a pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MutationDecision {
    /// Leave the pod alone.
    Disabled,
    /// Inject secrets.
    Enabled(Injection),
}

impl MutationDecision {
    /// Should we mutate this pod?
    pub fn is_enabled(&self) -> bool {
        matches!(self, MutationDecision::Enabled(_))
    }
}

/// Decide what to do with a pod with the specified annotations.
///
/// An error means the pod asked for injection in a way we can't honor. The
/// caller should treat that as "disabled", but still report it.
pub fn decide(annotations: &Annotations) -> Result<MutationDecision, AnnotationError> {
    let enabled = match annotations.get(ENABLED_ANNOTATION) {
        None => return Ok(MutationDecision::Disabled),
        Some(value) => parse_bool(ENABLED_ANNOTATION, value)?,
    };
    if !enabled {
        return Ok(MutationDecision::Disabled);
    }

    let role = annotations
        .get(ROLE_ANNOTATION)
        .filter(|role| !role.is_empty())
        .ok_or(AnnotationError::RoleRequired)?;
    Ok(MutationDecision::Enabled(Injection {
        role: role.to_owned(),
        store_address: annotations
            .get(ADDRESS_ANNOTATION)
            .filter(|address| !address.is_empty())
            .cloned(),
    }))
}

/// Should a failure to mutate this pod reject it?
///
/// A malformed value is reported, and treated as `false` so that we fail
/// open.
pub fn deny_on_failure(annotations: &Annotations) -> Result<bool, AnnotationError> {
    match annotations.get(DENY_ANNOTATION) {
        None => Ok(false),
        Some(value) => parse_bool(DENY_ANNOTATION, value),
    }
}

/// Parse a boolean the way Kubernetes users tend to write them.
fn parse_bool(key: &'static str, value: &str) -> Result<bool, AnnotationError> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        _ => Err(AnnotationError::InvalidBool {
            key,
            value: value.to_owned(),
        }),
    }
}

#[cfg(test)]
fn annotations(pairs: &[(&str, &str)]) -> Annotations {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

#[test]
fn no_annotations_means_disabled() {
    assert_eq!(decide(&Annotations::new()), Ok(MutationDecision::Disabled));
    // The role alone doesn't turn anything on.
    let role_only = annotations(&[(ROLE_ANNOTATION, "billing")]);
    assert_eq!(decide(&role_only), Ok(MutationDecision::Disabled));
}

#[test]
fn enabled_with_role() {
    let decision = decide(&annotations(&[
        (ENABLED_ANNOTATION, "true"),
        (ROLE_ANNOTATION, "x"),
    ]))
    .unwrap();
    assert!(decision.is_enabled());
    assert_eq!(
        decision,
        MutationDecision::Enabled(Injection {
            role: "x".to_owned(),
            store_address: None,
        })
    );
}

#[test]
fn enabled_without_role_is_an_error() {
    let missing = annotations(&[(ENABLED_ANNOTATION, "true")]);
    assert_eq!(decide(&missing), Err(AnnotationError::RoleRequired));

    let empty = annotations(&[(ENABLED_ANNOTATION, "True"), (ROLE_ANNOTATION, "")]);
    assert_eq!(decide(&empty), Err(AnnotationError::RoleRequired));
}

#[test]
fn explicitly_disabled_needs_no_role() {
    let off = annotations(&[(ENABLED_ANNOTATION, "false")]);
    assert_eq!(decide(&off), Ok(MutationDecision::Disabled));
}

#[test]
fn malformed_enabled_is_an_error() {
    let err = decide(&annotations(&[
        (ENABLED_ANNOTATION, "notabool"),
        (ROLE_ANNOTATION, "x"),
    ]))
    .unwrap_err();
    assert_eq!(
        err,
        AnnotationError::InvalidBool {
            key: ENABLED_ANNOTATION,
            value: "notabool".to_owned(),
        }
    );
}

#[test]
fn address_annotation_overrides_default() {
    let decision = decide(&annotations(&[
        (ENABLED_ANNOTATION, "1"),
        (ROLE_ANNOTATION, "x"),
        (ADDRESS_ANNOTATION, "https://vault.other:8200"),
    ]))
    .unwrap();
    match decision {
        MutationDecision::Enabled(injection) => {
            assert_eq!(
                injection.store_address_or("http://vault:8200"),
                "https://vault.other:8200"
            );
        }
        MutationDecision::Disabled => panic!("expected injection"),
    }

    let injection = Injection {
        role: "x".to_owned(),
        store_address: None,
    };
    assert_eq!(injection.store_address_or("http://vault:8200"), "http://vault:8200");
}

#[test]
fn deny_on_failure_parsing() {
    assert_eq!(deny_on_failure(&Annotations::new()), Ok(false));
    assert_eq!(deny_on_failure(&annotations(&[(DENY_ANNOTATION, "t")])), Ok(true));
    assert!(deny_on_failure(&annotations(&[(DENY_ANNOTATION, "yes")])).is_err());
}
