//! Errors reported when setting up the heaps of a server.

use std::{io, path::PathBuf};

/// Error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A heap could not be created, or warmed.
    #[error(transparent)]
    Heap(#[from] hpmalloc_core::Error),

    /// A file could not be read, or written.
    #[error("cannot access {path:?}: {source}")]
    Io {
        /// Path of the file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The settings cannot be parsed.
    #[error("malformed settings: {0}")]
    Settings(#[from] serde_json::Error),

    /// A setting has an invalid value.
    #[error("invalid setting {name}: {reason}")]
    InvalidSetting {
        /// Name of the setting.
        name: &'static str,
        /// Why the value is invalid.
        reason: String,
    },
}
