//! Decode guide and extraction errors. All of them are configuration or input problems:
//! callers surface them, nothing retries them.

use super::Field;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("No decode rules for host '{host}'. Add an entry to the decode guide or pass another host.")]
    HostNotFound { host: String },

    #[error("Decode guide entry for host '{host}' has no '{field}' rule.")]
    RuleMissing { host: String, field: Field },

    #[error("Invalid selector {selector:?} in '{field}' rule for host '{host}': {reason}")]
    InvalidSelector {
        host: String,
        field: Field,
        selector: String,
        reason: String,
    },

    #[error("'{field}' rule for host '{host}' asks for a custom processor, but none is registered.")]
    ProcessorMissing { host: String, field: Field },

    #[error("Could not parse {field} input for host '{host}': {reason}")]
    ParseFailure {
        host: String,
        field: Field,
        reason: String,
    },

    #[error("Cannot read decode guide {path}: {source}")]
    GuideIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid decode guide: {reason}")]
    InvalidGuide { reason: String },
}
