//! Error handling for the extraction engine
//!
//! This module provides idiomatic Rust error types using thiserror for
//! better error messages and proper error chain handling. Every failure
//! in the engine propagates through [`EngineError`]; no layer swallows
//! errors or returns partial results.

use std::sync::Arc;

use thiserror::Error;

/// Main error type for the extraction engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// A path segment did not match anything in the current value.
    #[error("path '{path}' not found at segment '{segment}'")]
    PathNotFound { path: String, segment: String },

    /// A path segment addressed a reserved (underscore-prefixed) member.
    #[error("cannot access reserved member '{segment}'")]
    AccessDenied { segment: String },

    /// An external source fetch failed (file IO, HTTP status, bad payload).
    #[error("fetch from '{locator}' failed: {message}")]
    Fetch { locator: String, message: String },

    /// A leaf transformation rejected or failed to process its input.
    #[error("filter '{filter}' failed: {message}")]
    Transform {
        filter: &'static str,
        message: String,
    },

    /// A sub-evaluation failed during a flatten fan-out.
    #[error("flatten sub-evaluation failed: {0}")]
    Composite(#[source] Box<EngineError>),

    /// The document stream could not be turned into a forest.
    #[error("invalid document: {0}")]
    Load(String),

    /// YAML syntax error while loading the document stream.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A failure observed through single-flight sharing: the initiating
    /// fetch failed and every joiner receives the same cause.
    #[error("{0}")]
    Shared(Arc<EngineError>),
}

impl EngineError {
    /// Wrap a fan-out failure, without stacking `Composite` layers when
    /// the error already comes from a nested flatten.
    pub(crate) fn into_composite(self) -> Self {
        match self {
            err @ EngineError::Composite(_) => err,
            err => EngineError::Composite(Box::new(err)),
        }
    }

    /// Walk `Shared`/`Composite` wrappers down to the originating failure.
    pub fn root_cause(&self) -> &EngineError {
        match self {
            EngineError::Shared(inner) => inner.root_cause(),
            EngineError::Composite(inner) => inner.root_cause(),
            other => other,
        }
    }
}
