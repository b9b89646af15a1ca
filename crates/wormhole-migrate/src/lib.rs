//! Live migration of checkpointed containers between hosts.
//!
//! The source host checkpoints a container and pushes the checkpoint as an
//! image ([`checkpoint`]). The destination host pulls it, grafts the
//! identifiers of a pre-provisioned placeholder container onto the
//! checkpointed runtime spec, and restores it ([`orchestrator`]).

use std::fmt;

use thiserror::Error;
use wormhole_common::WormholeError;

// Re-export dependencies potentially needed by consumers (like the server)
pub use wormhole_common as common;

pub mod checkpoint;
pub mod extractor;
pub mod locator;
pub mod orchestrator;
pub mod rewrite;
pub mod runtime;
pub mod store;
pub mod test_utils;
pub mod writer;

/// Which of the two documents a rewrite rule was matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecDocument {
    Checkpoint,
    Destination,
}

impl fmt::Display for SpecDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecDocument::Checkpoint => f.write_str("checkpoint spec"),
            SpecDocument::Destination => f.write_str("destination spec"),
        }
    }
}

// --- Custom Error Type ---
#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("Migration target not configured: {0} is required")]
    NotConfigured(&'static str),
    #[error("Invalid digest: {0:?}")]
    InvalidDigest(String),
    #[error("Blob not found: {0}")]
    BlobNotFound(String),
    #[error("Content store read failed for {digest}: {source}")]
    StoreRead {
        digest: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Content store write failed for {digest}: {source}")]
    StoreWrite {
        digest: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Container not found: {0}")]
    ContainerNotFound(String),
    #[error("Spec decode failed: {0}")]
    SpecDecode(String),
    #[error("Invalid rewrite pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("Rewrite rule for {0} has no capture group")]
    RuleWithoutCapture(rewrite::IdentifierKind),
    #[error("Rewrite rule {rule_index} ({rule}) did not match the {document}")]
    PatternNotMatched {
        rule_index: usize,
        rule: rewrite::IdentifierKind,
        document: SpecDocument,
    },
    #[error("Rewritten spec is {patched} bytes, exceeds the original {original} bytes")]
    LengthOverflow { original: usize, patched: usize },
    #[error("Runtime call {call} failed: {message}")]
    Runtime { call: &'static str, message: String },
}

impl MigrateError {
    pub(crate) fn runtime(call: &'static str, message: impl Into<String>) -> Self {
        MigrateError::Runtime {
            call,
            message: message.into(),
        }
    }
}

// Implement conversion from MigrateError to the common WormholeError
impl From<MigrateError> for WormholeError {
    fn from(err: MigrateError) -> Self {
        let message = err.to_string();
        match err {
            MigrateError::NotConfigured(_) => WormholeError::NotConfigured(message),
            MigrateError::BlobNotFound(_) | MigrateError::ContainerNotFound(_) => {
                WormholeError::NotFound(message)
            }
            MigrateError::StoreRead { .. }
            | MigrateError::StoreWrite { .. }
            | MigrateError::InvalidDigest(_) => WormholeError::Store(message),
            MigrateError::SpecDecode(_)
            | MigrateError::InvalidPattern(_)
            | MigrateError::RuleWithoutCapture(_)
            | MigrateError::PatternNotMatched { .. }
            | MigrateError::LengthOverflow { .. } => WormholeError::Rewrite(message),
            MigrateError::Runtime { .. } => WormholeError::Runtime(message),
        }
    }
}

// Define local Result using the crate's Error type
pub type Result<T> = std::result::Result<T, MigrateError>;

pub use checkpoint::CheckpointPipeline;
pub use orchestrator::{RestoreConfig, RestoreOrchestrator, RestoreOutcome, RestoreStage, StageFailure};
pub use rewrite::{IdentifierKind, PatchedSpec, RewriteReport, RewriteRule, RuleSet};
pub use runtime::{ContainerRuntime, CtrConfig, CtrRuntime};
pub use store::{ContentStore, Digest, LocalContentStore};
