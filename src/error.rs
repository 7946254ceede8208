//! Error types for loading endpoints, rendering responses, and the stores.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while turning endpoint definitions into a registry.
///
/// Any of these aborts the whole load; a partially built registry is never
/// published.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("endpoint '{endpoint_id}': invalid path '{path}': {reason}")]
    InvalidPath {
        endpoint_id: String,
        path: String,
        reason: String,
    },

    #[error("endpoint '{endpoint_id}': invalid body pattern: {source}")]
    InvalidBodyPattern {
        endpoint_id: String,
        #[source]
        source: regex::Error,
    },

    #[error("endpoint '{endpoint_id}': invalid header name '{name}'")]
    InvalidHeaderName { endpoint_id: String, name: String },

    #[error("endpoint '{endpoint_id}': response cannot declare both body and body_file")]
    BodyAndBodyFile { endpoint_id: String },

    #[error("endpoint '{endpoint_id}': failed to read body file {}: {source}", path.display())]
    BodyFile {
        endpoint_id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("endpoint '{endpoint_id}': {stage} template: {source}")]
    Template {
        endpoint_id: String,
        stage: RenderStage,
        #[source]
        source: Box<handlebars::TemplateError>,
    },

    #[error("duplicate endpoint id '{0}'")]
    DuplicateEndpointId(String),

    #[error("invalid endpoint id header name '{0}'")]
    InvalidEndpointIdHeader(String),
}

/// The three per-endpoint templates, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStage {
    Headers,
    Status,
    Body,
}

impl RenderStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderStage::Headers => "headers",
            RenderStage::Status => "status",
            RenderStage::Body => "body",
        }
    }
}

impl std::fmt::Display for RenderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-request rendering failure. Its display text becomes the 500 body.
#[derive(Debug, Error)]
#[error("failed to render {stage} for endpoint '{endpoint_id}': {message}")]
pub struct RenderError {
    pub endpoint_id: String,
    pub stage: RenderStage,
    pub message: String,
}

impl RenderError {
    pub fn new(endpoint_id: &str, stage: RenderStage, message: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.to_string(),
            stage,
            message: message.into(),
        }
    }
}

/// Errors surfaced by a [`Matchstore`](crate::matchstore::Matchstore) backend.
#[derive(Debug, Error)]
pub enum MatchstoreError {
    /// Raised by remote backends; the in-memory store never fails
    #[error("matchstore backend unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by a [`KvStore`](crate::kvstore::KvStore) backend.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("invalid JSON pointer '{0}'")]
    InvalidPointer(String),

    #[error("invalid path expression '{0}': {1}")]
    InvalidPathExpression(String, String),

    /// Raised by remote backends; the in-memory store never uses it
    #[error("kv backend unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_error_names_stage() {
        let err = RenderError::new("users", RenderStage::Status, "'abc' is not a status code");
        let text = err.to_string();
        assert!(text.contains("status"));
        assert!(text.contains("users"));
        assert!(text.contains("'abc' is not a status code"));
    }

    #[test]
    fn test_body_and_body_file_message() {
        let err = LoadError::BodyAndBodyFile {
            endpoint_id: "e1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "endpoint 'e1': response cannot declare both body and body_file"
        );
    }
}
