//! Request matching logic.
//!
//! Walks the endpoint trie along the request path, then filters the
//! endpoints registered for the request method by their secondary
//! predicates. When nothing matches, the outcome explains how far the
//! request got.

use crate::endpoint::{split_path, MatchRequest, MockEndpoint};
use crate::registry::{EndpointRegistry, EndpointSearchNode};
use crate::request::CapturedRequest;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Result of a successful match.
#[derive(Debug, Clone)]
pub struct MatchResult {
    /// The matched endpoint
    pub endpoint: Arc<MockEndpoint>,
    /// Path parameters captured from `{name}` segments
    pub path_params: HashMap<String, String>,
}

/// Outcome of matching one request.
#[derive(Debug, Clone)]
pub enum MatchOutcome {
    Matched(MatchResult),
    Mismatched(MismatchDetail),
}

/// Secondary predicate categories an endpoint can reject a request on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    Scheme,
    Host,
    Query,
    Headers,
    Body,
}

impl Predicate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Predicate::Scheme => "scheme",
            Predicate::Host => "host",
            Predicate::Query => "query",
            Predicate::Headers => "headers",
            Predicate::Body => "body",
        }
    }
}

/// Why a single candidate endpoint was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub endpoint_id: String,
    pub failed: Vec<Predicate>,
}

/// Why a request matched no endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MismatchDetail {
    /// The path left the trie; `matched` is the subpath walked so far
    Path { path: String, matched: String },
    /// The path matched but nothing is registered for the method
    Method { path: String, method: String },
    /// Candidates existed but each failed at least one predicate
    Predicates {
        path: String,
        method: String,
        rejections: Vec<Rejection>,
    },
}

impl fmt::Display for MismatchDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MismatchDetail::Path { path, matched } => write!(
                f,
                "path '{}' not matched, subpath which matched: '{}'",
                path, matched
            ),
            MismatchDetail::Method { path, method } => write!(
                f,
                "path '{}' matched, but no endpoint found with method '{}'",
                path, method
            ),
            MismatchDetail::Predicates {
                path,
                method,
                rejections,
            } => {
                write!(
                    f,
                    "path '{}' matched, but no endpoint with method '{}' accepted the request:",
                    path, method
                )?;
                for (i, rejection) in rejections.iter().enumerate() {
                    let failed: Vec<_> = rejection.failed.iter().map(Predicate::as_str).collect();
                    write!(
                        f,
                        "{} endpoint '{}' failed on {}",
                        if i == 0 { "" } else { ";" },
                        rejection.endpoint_id,
                        failed.join(", ")
                    )?;
                }
                Ok(())
            }
        }
    }
}

/// Request matcher over one registry snapshot.
pub struct Matcher<'a> {
    registry: &'a EndpointRegistry,
}

/// Where the path walk ended up.
struct Walk<'a> {
    node: &'a EndpointSearchNode,
    path_params: HashMap<String, String>,
}

impl<'a> Matcher<'a> {
    pub fn new(registry: &'a EndpointRegistry) -> Self {
        Self { registry }
    }

    /// Find the endpoint serving `request`, or explain why there is none.
    pub fn find_match(&self, request: &CapturedRequest) -> MatchOutcome {
        let walk = match self.walk(&request.path, &request.method) {
            Ok(walk) => walk,
            Err(matched) => {
                return MatchOutcome::Mismatched(MismatchDetail::Path {
                    path: request.path.clone(),
                    matched,
                })
            }
        };

        let candidates = match walk.node.endpoints_for(&request.method) {
            Some(candidates) if !candidates.is_empty() => candidates,
            _ => {
                return MatchOutcome::Mismatched(MismatchDetail::Method {
                    path: request.path.clone(),
                    method: request.method.clone(),
                })
            }
        };

        let query = request.query_params();
        let mut rejections = Vec::new();
        for endpoint in candidates {
            let failed = failed_predicates(&endpoint.request, request, &query);
            if failed.is_empty() {
                return MatchOutcome::Matched(MatchResult {
                    endpoint: Arc::clone(endpoint),
                    path_params: walk.path_params,
                });
            }
            rejections.push(Rejection {
                endpoint_id: endpoint.id.clone(),
                failed,
            });
        }

        MatchOutcome::Mismatched(MismatchDetail::Predicates {
            path: request.path.clone(),
            method: request.method.clone(),
            rejections,
        })
    }

    /// Walk the trie along `path`. On failure returns the matched subpath.
    fn walk(&self, path: &str, method: &str) -> Result<Walk<'a>, String> {
        let segments = split_path(path);
        let mut node = self.registry.root();
        let mut matched: Vec<&str> = Vec::new();
        let mut path_params = HashMap::new();
        let mut i = 0;

        while i < segments.len() {
            let segment = segments[i];

            if let Some(child) = node.literal_child(segment) {
                node = child;
                matched.push(segment);
                i += 1;
                continue;
            }

            if let Some(child) = node.wildcard_child() {
                for name in child.param_names() {
                    path_params.insert(name.clone(), segment.to_string());
                }
                node = child;
                matched.push(segment);
                i += 1;
                continue;
            }

            if let Some(multi) = node.multi_wildcard_child() {
                // Consume segments until one can continue below the `**` node.
                let resume = segments[i..]
                    .iter()
                    .position(|s| multi.literal_child(s).is_some())
                    .map(|offset| i + offset)
                    .or_else(|| multi.wildcard_child().map(|_| segments.len() - 1));

                node = multi;
                match resume {
                    Some(next) => {
                        matched.extend(&segments[i..next]);
                        i = next;
                    }
                    None => {
                        matched.extend(&segments[i..]);
                        i = segments.len();
                    }
                }
                continue;
            }

            return Err(matched.join("/"));
        }

        // `**` also matches zero trailing segments.
        if node.endpoints_for(method).map_or(true, |e| e.is_empty()) {
            if let Some(multi) = node.multi_wildcard_child() {
                node = multi;
            }
        }

        Ok(Walk { node, path_params })
    }
}

/// Predicates of `expected` that `request` fails, in evaluation order.
fn failed_predicates(
    expected: &MatchRequest,
    request: &CapturedRequest,
    query: &HashMap<String, Vec<String>>,
) -> Vec<Predicate> {
    let mut failed = Vec::new();

    if let Some(scheme) = &expected.scheme {
        if *scheme != request.scheme {
            failed.push(Predicate::Scheme);
        }
    }

    if let Some(host) = &expected.host {
        if !host_matches(host, request) {
            failed.push(Predicate::Host);
        }
    }

    let query_ok = expected.query.iter().all(|(name, value)| {
        query
            .get(name)
            .map(|values| values.iter().any(|v| v == value))
            .unwrap_or(false)
    });
    if !query_ok {
        failed.push(Predicate::Query);
    }

    let headers_ok = expected.headers.iter().all(|(name, value)| {
        request
            .headers
            .get_all(name)
            .iter()
            .any(|v| v.as_bytes() == value.as_bytes())
    });
    if !headers_ok {
        failed.push(Predicate::Headers);
    }

    if let Some(pattern) = &expected.body {
        let body_ok = request
            .body
            .as_ref()
            .map(|body| pattern.is_match(body))
            .unwrap_or(false);
        if !body_ok {
            failed.push(Predicate::Body);
        }
    }

    failed
}

fn host_matches(expected: &str, request: &CapturedRequest) -> bool {
    if expected.contains(':') && !expected.starts_with('[') {
        request
            .host
            .as_deref()
            .map(|h| h.eq_ignore_ascii_case(expected))
            .unwrap_or(false)
    } else {
        request.host_name().as_deref() == Some(expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockServerConfig;
    use crate::endpoint::EndpointLoader;
    use crate::registry::tests::endpoint;
    use bytes::Bytes;
    use hyper::Request;

    fn request(method: &str, uri: &str) -> CapturedRequest {
        request_with(method, uri, &[], "")
    }

    fn request_with(method: &str, uri: &str, headers: &[(&str, &str)], body: &str) -> CapturedRequest {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        CapturedRequest::from_parts(&parts, Some(Bytes::from(body.to_string())))
    }

    fn registry(yaml: &str) -> EndpointRegistry {
        let config = MockServerConfig::from_yaml(yaml).unwrap();
        EndpointRegistry::new(EndpointLoader::new().load(&config).unwrap())
    }

    fn matched_id(registry: &EndpointRegistry, req: &CapturedRequest) -> Option<String> {
        match Matcher::new(registry).find_match(req) {
            MatchOutcome::Matched(result) => Some(result.endpoint.id.clone()),
            MatchOutcome::Mismatched(_) => None,
        }
    }

    fn mismatch(registry: &EndpointRegistry, req: &CapturedRequest) -> MismatchDetail {
        match Matcher::new(registry).find_match(req) {
            MatchOutcome::Matched(result) => panic!("unexpected match: {}", result.endpoint.id),
            MatchOutcome::Mismatched(detail) => detail,
        }
    }

    #[test]
    fn test_exact_path_matching() {
        let registry = EndpointRegistry::new(vec![endpoint("exact", "GET", "/api/users", 0)]);

        assert_eq!(matched_id(&registry, &request("GET", "/api/users")).as_deref(), Some("exact"));
        assert!(matched_id(&registry, &request("GET", "/api")).is_none());
        assert!(matched_id(&registry, &request("GET", "/api/users/1")).is_none());
        assert!(matched_id(&registry, &request("GET", "/api/posts")).is_none());
    }

    #[test]
    fn test_root_path() {
        let registry = EndpointRegistry::new(vec![endpoint("root", "GET", "/", 0)]);
        assert_eq!(matched_id(&registry, &request("GET", "/")).as_deref(), Some("root"));
        assert!(matched_id(&registry, &request("GET", "/x")).is_none());
    }

    #[test]
    fn test_wildcard_matching() {
        let registry = EndpointRegistry::new(vec![endpoint("wild", "GET", "/wildcard/*/foo", 0)]);

        assert!(matched_id(&registry, &request("GET", "/wildcard/bar/foo")).is_some());
        assert!(matched_id(&registry, &request("GET", "/wildcard/anything/foo")).is_some());
        assert!(matched_id(&registry, &request("GET", "/wildcard/bar/foo/extra")).is_none());
        assert!(matched_id(&registry, &request("GET", "/wildcard/foo")).is_none());
    }

    #[test]
    fn test_multi_wildcard_matching() {
        let registry = EndpointRegistry::new(vec![endpoint("all", "GET", "/all/**/foo", 0)]);

        assert!(matched_id(&registry, &request("GET", "/all/foo")).is_some());
        assert!(matched_id(&registry, &request("GET", "/all/bar/foo")).is_some());
        assert!(matched_id(&registry, &request("GET", "/all/bar/baz/foo")).is_some());
        assert!(matched_id(&registry, &request("GET", "/all/bar/foo/extra")).is_none());
        assert!(matched_id(&registry, &request("GET", "/all/bar")).is_none());
    }

    #[test]
    fn test_trailing_multi_wildcard() {
        let registry = EndpointRegistry::new(vec![endpoint("static", "GET", "/static/**", 0)]);

        assert!(matched_id(&registry, &request("GET", "/static")).is_some());
        assert!(matched_id(&registry, &request("GET", "/static/css/site.css")).is_some());
        assert!(matched_id(&registry, &request("GET", "/other")).is_none());
    }

    #[test]
    fn test_trailing_multi_wildcard_under_other_method() {
        let registry = EndpointRegistry::new(vec![
            endpoint("get-static", "GET", "/static", 0),
            endpoint("post-static", "POST", "/static/**", 0),
        ]);

        assert_eq!(matched_id(&registry, &request("GET", "/static")).as_deref(), Some("get-static"));
        assert_eq!(matched_id(&registry, &request("POST", "/static")).as_deref(), Some("post-static"));
        assert_eq!(matched_id(&registry, &request("POST", "/static/a")).as_deref(), Some("post-static"));
        assert!(matches!(
            mismatch(&registry, &request("PUT", "/static")),
            MismatchDetail::Method { .. }
        ));
    }

    #[test]
    fn test_literal_preferred_over_param() {
        let registry = EndpointRegistry::new(vec![
            endpoint("by-id", "GET", "/users/{id}", 0),
            endpoint("me", "GET", "/users/me", 0),
        ]);
        assert_eq!(matched_id(&registry, &request("GET", "/users/me")).as_deref(), Some("me"));
        assert_eq!(matched_id(&registry, &request("GET", "/users/7")).as_deref(), Some("by-id"));
    }

    #[test]
    fn test_path_param_capture() {
        let registry = EndpointRegistry::new(vec![endpoint("user", "GET", "/users/{id}/posts/{post}", 0)]);

        match Matcher::new(&registry).find_match(&request("GET", "/users/42/posts/abc")) {
            MatchOutcome::Matched(result) => {
                assert_eq!(result.path_params.get("id"), Some(&"42".to_string()));
                assert_eq!(result.path_params.get("post"), Some(&"abc".to_string()));
            }
            MatchOutcome::Mismatched(detail) => panic!("mismatch: {}", detail),
        }
    }

    #[test]
    fn test_priority_tie_break() {
        let registry = EndpointRegistry::new(vec![
            endpoint("five", "GET", "/p", 5),
            endpoint("ten", "GET", "/p", 10),
        ]);
        for _ in 0..3 {
            assert_eq!(matched_id(&registry, &request("GET", "/p")).as_deref(), Some("ten"));
        }
    }

    #[test]
    fn test_query_superset() {
        let registry = registry(
            r#"
mocks:
  - name: q
    endpoints:
      - id: needs-a
        request:
          path: /q
          query:
            a: "1"
"#,
        );
        assert!(matched_id(&registry, &request("GET", "/q?a=1&b=2")).is_some());
        assert!(matched_id(&registry, &request("GET", "/q?b=2&a=1")).is_some());
        assert!(matched_id(&registry, &request("GET", "/q?b=2")).is_none());
        assert!(matched_id(&registry, &request("GET", "/q?a=2")).is_none());
    }

    #[test]
    fn test_header_matching_is_case_insensitive_on_names() {
        let registry = registry(
            r#"
mocks:
  - name: h
    endpoints:
      - id: tenant
        request:
          path: /h
          headers:
            X-Tenant: acme
"#,
        );
        let ok = request_with("GET", "/h", &[("x-tenant", "acme")], "");
        let wrong = request_with("GET", "/h", &[("X-Tenant", "ACME")], "");
        assert!(matched_id(&registry, &ok).is_some());
        assert!(matched_id(&registry, &wrong).is_none());
        assert!(matched_id(&registry, &request("GET", "/h")).is_none());
    }

    #[test]
    fn test_body_pattern() {
        let registry = registry(
            r#"
mocks:
  - name: b
    endpoints:
      - id: named
        request:
          method: POST
          path: /b
          body: '"name":\s*"\w+"'
"#,
        );
        let ok = request_with("POST", "/b", &[], r#"{"name": "John"}"#);
        let bad = request_with("POST", "/b", &[], r#"{"age": 3}"#);
        assert!(matched_id(&registry, &ok).is_some());
        assert!(matched_id(&registry, &bad).is_none());

        // Non-UTF-8 bytes around the pattern still match
        let mut binary = ok.clone();
        binary.body = Some(Bytes::from_static(b"\xff\xfe{\"name\": \"John\"}\x00"));
        assert!(matched_id(&registry, &binary).is_some());

        // Unreadable body rejects the candidate instead of failing
        let mut unreadable = ok.clone();
        unreadable.body = None;
        assert!(matched_id(&registry, &unreadable).is_none());
    }

    #[test]
    fn test_host_and_scheme() {
        let registry = registry(
            r#"
mocks:
  - name: h
    endpoints:
      - id: api-host
        request:
          host: API.local
          path: /h
      - id: tls-only
        request:
          scheme: https
          path: /s
"#,
        );
        let ok = request_with("GET", "/h", &[("Host", "api.local:8080")], "");
        let other = request_with("GET", "/h", &[("Host", "other.local")], "");
        assert!(matched_id(&registry, &ok).is_some());
        assert!(matched_id(&registry, &other).is_none());
        assert!(matched_id(&registry, &request("GET", "/s")).is_none());
        assert!(matched_id(&registry, &request("GET", "https://x.local/s")).is_some());
    }

    #[test]
    fn test_predicates_fall_through_to_lower_priority() {
        let registry = registry(
            r#"
mocks:
  - name: a
    endpoints:
      - id: plain
        request:
          path: /a
      - id: with-header
        priority: 1
        request:
          path: /a
          headers:
            X: "1"
"#,
        );
        let with = request_with("GET", "/a", &[("X", "1")], "");
        assert_eq!(matched_id(&registry, &with).as_deref(), Some("with-header"));
        assert_eq!(matched_id(&registry, &request("GET", "/a")).as_deref(), Some("plain"));
    }

    #[test]
    fn test_path_mismatch_detail() {
        let registry = EndpointRegistry::new(vec![endpoint("minimal", "GET", "/minimal", 0)]);

        let detail = mismatch(&registry, &request("GET", "/minimal/foo"));
        assert_eq!(
            detail,
            MismatchDetail::Path {
                path: "/minimal/foo".to_string(),
                matched: "minimal".to_string(),
            }
        );
        let text = detail.to_string();
        assert!(text.contains("'/minimal/foo' not matched"));
        assert!(text.contains("subpath which matched: 'minimal'"));

        let detail = mismatch(&registry, &request("GET", "/other"));
        assert!(matches!(detail, MismatchDetail::Path { matched, .. } if matched.is_empty()));
    }

    #[test]
    fn test_method_mismatch_detail() {
        let registry = EndpointRegistry::new(vec![endpoint("get", "GET", "/m", 0)]);
        let detail = mismatch(&registry, &request("DELETE", "/m"));
        assert_eq!(
            detail.to_string(),
            "path '/m' matched, but no endpoint found with method 'DELETE'"
        );
    }

    #[test]
    fn test_predicate_mismatch_detail() {
        let registry = registry(
            r#"
mocks:
  - name: p
    endpoints:
      - id: first
        priority: 2
        request:
          method: POST
          path: /p
          query:
            a: "1"
          body: "^ok$"
      - id: second
        request:
          method: POST
          path: /p
          headers:
            X-Key: secret
"#,
        );
        let detail = mismatch(&registry, &request_with("POST", "/p", &[], "nope"));
        match &detail {
            MismatchDetail::Predicates { rejections, .. } => {
                assert_eq!(rejections.len(), 2);
                assert_eq!(rejections[0].endpoint_id, "first");
                assert_eq!(rejections[0].failed, vec![Predicate::Query, Predicate::Body]);
                assert_eq!(rejections[1].endpoint_id, "second");
                assert_eq!(rejections[1].failed, vec![Predicate::Headers]);
            }
            other => panic!("unexpected detail: {:?}", other),
        }
        let text = detail.to_string();
        assert!(text.contains("endpoint 'first' failed on query, body"));
        assert!(text.contains("endpoint 'second' failed on headers"));
    }
}
