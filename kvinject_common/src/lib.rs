//! Code shared between the `kvinjectd` admission webhook and the
//! `kvinject-init` secret materializer.

#![warn(missing_docs)]

pub use anyhow;
pub use serde_json;
pub use tracing;

pub mod errors;
#[cfg(any(test, feature = "fake-vault"))]
pub mod fake_vault;
pub mod mapping;
pub mod tracing_support;
pub mod vault;

/// Common imports used by many modules.
pub mod prelude {
    pub use anyhow::Context as _;
    pub use serde::{Deserialize, Serialize};
    pub use std::{
        collections::{BTreeMap, HashMap},
        fmt,
        io::Write,
        path::{Path, PathBuf},
    };
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use super::mapping::SecretMapping;
    pub use super::{Error, Result};
}

/// Error type for this crate's functions.
pub use anyhow::Error;

/// Result type for this crate's functions.
pub use anyhow::Result;
