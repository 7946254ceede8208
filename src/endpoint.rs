//! Endpoint model.
//!
//! Compiled, immutable forms of the definitions in [`crate::config`]. An
//! endpoint is built once at load time and shared read-only between requests.

use crate::config::{EndpointDefinition, MockServerConfig, RequestDefinition, ResponseDefinition};
use crate::error::LoadError;
use hyper::header::HeaderName;
use regex::bytes::Regex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A named group of endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mock {
    pub name: String,
}

/// One segment of an endpoint path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Matched exactly
    Literal(String),
    /// `{name}`: any single segment, captured under `name`
    Param(String),
    /// `*`: any single segment
    Wildcard,
    /// `**`: zero or more segments
    MultiWildcard,
}

impl PathSegment {
    /// Key of the trie child this segment lives under.
    pub fn key(&self) -> &str {
        match self {
            PathSegment::Literal(s) => s,
            PathSegment::Param(_) | PathSegment::Wildcard => WILDCARD,
            PathSegment::MultiWildcard => MULTI_WILDCARD,
        }
    }
}

pub const WILDCARD: &str = "*";
pub const MULTI_WILDCARD: &str = "**";

/// Split a request path into segments, dropping the leading empty segment.
///
/// `/` yields no segments; a trailing slash yields a trailing empty segment.
pub fn split_path(path: &str) -> Vec<&str> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('/').collect()
    }
}

/// Parse a path pattern into segments.
pub fn parse_path_pattern(pattern: &str) -> Result<Vec<PathSegment>, String> {
    if !pattern.starts_with('/') {
        return Err("path must begin with '/'".to_string());
    }

    split_path(pattern)
        .into_iter()
        .map(|segment| match segment {
            WILDCARD => Ok(PathSegment::Wildcard),
            MULTI_WILDCARD => Ok(PathSegment::MultiWildcard),
            s if s.starts_with('{') && s.ends_with('}') => {
                let name = &s[1..s.len() - 1];
                if name.is_empty() || name.contains(['{', '}']) {
                    Err(format!("invalid parameter segment '{}'", s))
                } else {
                    Ok(PathSegment::Param(name.to_string()))
                }
            }
            s if s.contains(['{', '}']) => Err(format!("unbalanced braces in segment '{}'", s)),
            s if s.contains('*') => Err(format!("'*' must be a whole segment, got '{}'", s)),
            s => Ok(PathSegment::Literal(s.to_string())),
        })
        .collect()
}

/// Declarative request predicate.
#[derive(Debug, Clone)]
pub struct MatchRequest {
    pub scheme: Option<String>,
    pub host: Option<String>,
    /// Upper-cased method
    pub method: String,
    pub path: String,
    pub segments: Vec<PathSegment>,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(HeaderName, String)>,
    pub body: Option<Regex>,
}

impl MatchRequest {
    fn compile(endpoint_id: &str, def: &RequestDefinition) -> Result<Self, LoadError> {
        let segments = parse_path_pattern(&def.path).map_err(|reason| LoadError::InvalidPath {
            endpoint_id: endpoint_id.to_string(),
            path: def.path.clone(),
            reason,
        })?;

        let body = def
            .body
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|source| LoadError::InvalidBodyPattern {
                endpoint_id: endpoint_id.to_string(),
                source,
            })?;

        let mut headers = def
            .headers
            .iter()
            .map(|(name, value)| {
                HeaderName::from_bytes(name.as_bytes())
                    .map(|name| (name, value.clone()))
                    .map_err(|_| LoadError::InvalidHeaderName {
                        endpoint_id: endpoint_id.to_string(),
                        name: name.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        headers.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));

        let mut query: Vec<_> = def
            .query
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        query.sort();

        let method = if def.method.trim().is_empty() {
            "GET".to_string()
        } else {
            def.method.trim().to_uppercase()
        };

        Ok(Self {
            scheme: def.scheme.as_ref().map(|s| s.to_lowercase()),
            host: def.host.as_ref().map(|h| h.to_lowercase()),
            method,
            path: def.path.clone(),
            segments,
            query,
            headers,
            body,
        })
    }
}

/// Response template sources. Compiled by [`crate::template::TemplateEngine`].
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: String,
    pub headers: Option<String>,
    pub body: Option<String>,
    pub body_file: Option<PathBuf>,
}

impl MockResponse {
    fn from_definition(endpoint_id: &str, def: &ResponseDefinition) -> Result<Self, LoadError> {
        if def.body.is_some() && def.body_file.is_some() {
            return Err(LoadError::BodyAndBodyFile {
                endpoint_id: endpoint_id.to_string(),
            });
        }
        Ok(Self {
            status: def.status.clone(),
            headers: def.headers.clone(),
            body: def.body.clone(),
            body_file: def.body_file.clone(),
        })
    }
}

/// A loaded endpoint.
#[derive(Debug, Clone)]
pub struct MockEndpoint {
    pub id: String,
    pub priority: i64,
    pub mock: Arc<Mock>,
    pub request: MatchRequest,
    pub response: MockResponse,
}

impl MockEndpoint {
    /// Compile an endpoint definition under an already-assigned id.
    pub fn compile(id: String, mock: Arc<Mock>, def: &EndpointDefinition) -> Result<Self, LoadError> {
        let request = MatchRequest::compile(&id, &def.request)?;
        let response = MockResponse::from_definition(&id, &def.response)?;
        Ok(Self {
            id,
            priority: def.priority,
            mock,
            request,
            response,
        })
    }
}

/// Turns configuration into compiled endpoints.
///
/// Holds the id counter so generated ids keep increasing across reloads.
#[derive(Debug, Default)]
pub struct EndpointLoader {
    next_id: AtomicU64,
}

impl EndpointLoader {
    pub fn new() -> Self {
        Self::default()
    }

    fn generate_id(&self) -> String {
        format!("endpoint-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Compile every endpoint in the configuration, in declaration order.
    pub fn load(&self, config: &MockServerConfig) -> Result<Vec<Arc<MockEndpoint>>, LoadError> {
        let mut ids = HashSet::new();
        let mut endpoints = Vec::with_capacity(config.endpoint_count());

        for mock_def in &config.mocks {
            let mock = Arc::new(Mock {
                name: mock_def.name.clone(),
            });
            for def in &mock_def.endpoints {
                let id = def.id.clone().unwrap_or_else(|| self.generate_id());
                if !ids.insert(id.clone()) {
                    return Err(LoadError::DuplicateEndpointId(id));
                }
                endpoints.push(Arc::new(MockEndpoint::compile(id, Arc::clone(&mock), def)?));
            }
        }

        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert!(split_path("/").is_empty());
        assert_eq!(split_path("/a/b"), vec!["a", "b"]);
        assert_eq!(split_path("/a/"), vec!["a", ""]);
    }

    #[test]
    fn test_parse_path_pattern() {
        let segments = parse_path_pattern("/users/{id}/*/files/**").unwrap();
        assert_eq!(
            segments,
            vec![
                PathSegment::Literal("users".to_string()),
                PathSegment::Param("id".to_string()),
                PathSegment::Wildcard,
                PathSegment::Literal("files".to_string()),
                PathSegment::MultiWildcard,
            ]
        );
    }

    #[test]
    fn test_parse_malformed_path() {
        assert!(parse_path_pattern("users").is_err());
        assert!(parse_path_pattern("/users/{}").is_err());
        assert!(parse_path_pattern("/users/{id").is_err());
        assert!(parse_path_pattern("/users/a*b").is_err());
    }

    fn config(yaml: &str) -> MockServerConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_load_generates_ids() {
        let config = config(
            r#"
mocks:
  - name: m
    endpoints:
      - request:
          path: /a
      - id: named
        request:
          method: post
          path: /b
"#,
        );
        let loader = EndpointLoader::new();
        let endpoints = loader.load(&config).unwrap();
        assert_eq!(endpoints[0].id, "endpoint-1");
        assert_eq!(endpoints[1].id, "named");
        assert_eq!(endpoints[1].request.method, "POST");
        assert_eq!(endpoints[0].mock.name, "m");

        // Counter is monotonic across loads
        let endpoints = loader.load(&config).unwrap();
        assert_eq!(endpoints[0].id, "endpoint-2");
    }

    #[test]
    fn test_load_rejects_bad_body_pattern() {
        let config = config(
            r#"
mocks:
  - name: m
    endpoints:
      - id: broken
        request:
          path: /a
          body: "(unclosed"
"#,
        );
        let err = EndpointLoader::new().load(&config).unwrap_err();
        assert!(matches!(err, LoadError::InvalidBodyPattern { .. }));
    }

    #[test]
    fn test_load_rejects_malformed_path() {
        let config = config(
            r#"
mocks:
  - name: m
    endpoints:
      - id: broken
        request:
          path: /a/{b
"#,
        );
        let err = EndpointLoader::new().load(&config).unwrap_err();
        assert!(matches!(err, LoadError::InvalidPath { .. }));
    }

    #[test]
    fn test_load_rejects_duplicate_ids() {
        let config = config(
            r#"
mocks:
  - name: m
    endpoints:
      - id: dup
        request:
          path: /a
      - id: dup
        request:
          path: /b
"#,
        );
        let err = EndpointLoader::new().load(&config).unwrap_err();
        assert!(matches!(err, LoadError::DuplicateEndpointId(id) if id == "dup"));
    }
}
