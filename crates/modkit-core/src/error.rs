//! Error types for the plugin loader core.

use std::collections::BTreeSet;
use std::path::PathBuf;

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, PluginError>;

/// Errors surfaced by the loader and the registration handshake.
///
/// Every variant here is recoverable: a failing call reports its problem and
/// leaves loader state untouched. A resolved name that is missing from an
/// internal map is a bug in this crate and panics instead of appearing here.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The platform could not open the module at the given path.
    #[error("error while opening module [{path}]: {reason}")]
    OpenFailed { path: PathBuf, reason: String },

    /// A record's declared layout disagrees with the layout compiled into the
    /// host. The record is refused before any of its fields are read.
    #[error(
        "plugin record layout mismatch: \
         size expected {expected_size} | received {received_size}, \
         alignment expected {expected_align} | received {received_align}"
    )]
    AbiMismatch {
        expected_size: usize,
        received_size: usize,
        expected_align: usize,
        received_align: usize,
    },

    /// A module exposed the legacy table hook with an unsupported version.
    #[error(
        "module [{path}] reports legacy registration version {received}, \
         but version {expected} is required"
    )]
    LegacyVersionMismatch {
        path: PathBuf,
        expected: u32,
        received: u32,
    },

    /// A module advertised the legacy table hook but handed back nothing.
    #[error("module [{path}] advertised the legacy registration hook but returned no record table")]
    LegacyTableMissing { path: PathBuf },

    /// No plugin matches the requested name or alias.
    #[error("could not find a plugin with the name or alias [{0}]")]
    NotFound(String),

    /// An alias matches more than one plugin and cannot be resolved.
    #[error("the alias [{alias}] refers to multiple plugins: {candidates:?}")]
    AmbiguousAlias {
        alias: String,
        candidates: BTreeSet<String>,
    },

    /// A plugin factory ran but produced a null instance.
    #[error("the factory for plugin [{0}] returned no instance")]
    NullInstance(String),
}
