//! Secret mappings: which field of which secret store path ends up under
//! which environment variable name.
//!
//! Mappings arrive in two shapes. The materializer receives them as
//! `NAME:PATH:KEY` directives on its command line, and the webhook discovers
//! them as `vault:PATH:KEY` placeholders in a pod's environment variables.

use std::str::FromStr;

use crate::prelude::*;

/// Environment variable values starting with this prefix are secret
/// placeholders.
pub const PLACEHOLDER_PREFIX: &str = "vault:";

/// Separates the fields of a directive or placeholder.
const FIELD_SEPARATOR: char = ':';

/// Errors which can occur while parsing a mapping directive.
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    /// The directive did not split into exactly three fields.
    #[error("secret mapping {directive:?} must have the form NAME:PATH:KEY")]
    Malformed {
        /// The directive we were given.
        directive: String,
    },

    /// One of the three fields was empty.
    #[error("secret mapping {directive:?} has an empty {field}")]
    EmptyField {
        /// The directive we were given.
        directive: String,
        /// Which field was empty.
        field: &'static str,
    },
}

/// A single secret to materialize. All three fields are guaranteed to be
/// non-empty.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SecretMapping {
    target_name: String,
    secret_path: String,
    secret_key: String,
}

impl SecretMapping {
    /// Build a mapping from its parts, rejecting empty fields.
    pub fn new(
        target_name: &str,
        secret_path: &str,
        secret_key: &str,
    ) -> std::result::Result<SecretMapping, MappingError> {
        let empty = |field| MappingError::EmptyField {
            directive: format!("{}:{}:{}", target_name, secret_path, secret_key),
            field,
        };
        if target_name.is_empty() {
            return Err(empty("name"));
        }
        if secret_path.is_empty() {
            return Err(empty("path"));
        }
        if secret_key.is_empty() {
            return Err(empty("key"));
        }
        Ok(SecretMapping {
            target_name: target_name.to_owned(),
            secret_path: secret_path.to_owned(),
            secret_key: secret_key.to_owned(),
        })
    }

    /// Try to interpret an environment variable as a secret placeholder.
    ///
    /// Returns `None` for anything that isn't a well-formed placeholder,
    /// because most environment variables aren't placeholders at all.
    pub fn from_placeholder(env_name: &str, value: &str) -> Option<SecretMapping> {
        let rest = value.strip_prefix(PLACEHOLDER_PREFIX)?;
        let fields = rest.split(FIELD_SEPARATOR).collect::<Vec<_>>();
        match fields.as_slice() {
            [path, key] => SecretMapping::new(env_name, path, key).ok(),
            _ => None,
        }
    }

    /// The environment variable name the workload will look this value up
    /// by.
    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// The path of the secret collection in the store.
    pub fn secret_path(&self) -> &str {
        &self.secret_path
    }

    /// The field within the secret collection.
    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }
}

impl FromStr for SecretMapping {
    type Err = MappingError;

    /// Parse a `NAME:PATH:KEY` directive.
    fn from_str(directive: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = directive.trim();
        let fields = trimmed.split(FIELD_SEPARATOR).collect::<Vec<_>>();
        match fields.as_slice() {
            [name, path, key] => SecretMapping::new(name, path, key),
            _ => Err(MappingError::Malformed {
                directive: directive.to_owned(),
            }),
        }
    }
}

impl fmt::Display for SecretMapping {
    /// Format as a `NAME:PATH:KEY` directive.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.target_name, self.secret_path, self.secret_key
        )
    }
}

/// Parse a list of `NAME:PATH:KEY` directives, preserving their order.
pub fn parse_directives<S: AsRef<str>>(
    directives: &[S],
) -> std::result::Result<Vec<SecretMapping>, MappingError> {
    directives.iter().map(|d| d.as_ref().parse()).collect()
}

#[test]
fn parses_directives() {
    let mapping = "DB_PASSWORD:secret/sql:password"
        .parse::<SecretMapping>()
        .unwrap();
    assert_eq!(mapping.target_name(), "DB_PASSWORD");
    assert_eq!(mapping.secret_path(), "secret/sql");
    assert_eq!(mapping.secret_key(), "password");

    // Surrounding whitespace is ignored.
    let padded = "  A:b:c\n".parse::<SecretMapping>().unwrap();
    assert_eq!(padded, SecretMapping::new("A", "b", "c").unwrap());
}

#[test]
fn rejects_malformed_directives() {
    for bad in &["", "NAME", "NAME:path", "NAME:path:key:extra"] {
        match bad.parse::<SecretMapping>() {
            Err(MappingError::Malformed { directive }) => assert_eq!(&directive, bad),
            other => panic!("expected Malformed for {:?}, got {:?}", bad, other),
        }
    }
    for bad in &[":path:key", "NAME::key", "NAME:path:"] {
        assert!(matches!(
            bad.parse::<SecretMapping>(),
            Err(MappingError::EmptyField { .. })
        ));
    }
}

#[test]
fn parse_directives_keeps_order_and_duplicates() {
    let mappings =
        parse_directives(&["B:p:k", "A:p:k", "B:q:k"]).expect("parse failed");
    let names = mappings.iter().map(|m| m.target_name()).collect::<Vec<_>>();
    assert_eq!(names, &["B", "A", "B"]);

    assert!(parse_directives(&["A:p:k", "broken"]).is_err());
}

#[test]
fn extracts_placeholders() {
    let mapping = SecretMapping::from_placeholder("PGPASSWORD", "vault:/a/b:k")
        .expect("placeholder not recognized");
    assert_eq!(mapping.target_name(), "PGPASSWORD");
    assert_eq!(mapping.secret_path(), "/a/b");
    assert_eq!(mapping.secret_key(), "k");
}

#[test]
fn ignores_non_placeholders() {
    let examples = &[
        "plain value",
        "vault",
        "VAULT:/a/b:k",
        " vault:/a/b:k",
        "vault:/a/b",
        "vault:/a/b:k:extra",
        "vault::k",
        "vault:/a/b:",
    ];
    for value in examples {
        assert_eq!(SecretMapping::from_placeholder("NAME", value), None);
    }
}

#[test]
fn display_round_trips_through_directive_form() {
    let mapping = SecretMapping::new("TOKEN", "secret/api", "token").unwrap();
    assert_eq!(mapping.to_string(), "TOKEN:secret/api:token");
}
