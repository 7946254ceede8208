//! Mock server host glue.
//!
//! [`MockServer`] owns the current registry snapshot and ties matching,
//! rendering, writing and recording together. Reloads build a complete new
//! snapshot and swap it in; requests already in flight keep the snapshot
//! they started with.

use crate::admin;
use crate::config::{GlobalSettings, MockServerConfig};
use crate::endpoint::EndpointLoader;
use crate::error::LoadError;
use crate::kvstore::{InMemoryKvStore, KvStore};
use crate::matcher::{MatchOutcome, MatchResult, Matcher, MismatchDetail};
use crate::matchstore::{InMemoryMatchstore, Matchstore, MatchstoreOptions};
use crate::recorder::Recorder;
use crate::registry::EndpointRegistry;
use crate::request::CapturedRequest;
use crate::response::{actual_response, json_response, write_response};
use crate::template::{ResponseTemplateData, TemplateEngine};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Body;
use hyper::header::{HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::convert::Infallible;
use std::fmt::Display;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Everything a request needs, built and published as one unit.
struct Snapshot {
    registry: EndpointRegistry,
    templates: TemplateEngine,
    settings: GlobalSettings,
    endpoint_id_header: HeaderName,
}

/// A successful match, bound to the endpoints it was made against.
///
/// [`MockServer::respond`] renders from the same snapshot even if a reload
/// happens in between.
pub struct MatchedRequest {
    snapshot: Arc<Snapshot>,
    result: MatchResult,
}

impl MatchedRequest {
    pub fn result(&self) -> &MatchResult {
        &self.result
    }
}

/// Programmable HTTP mock server.
pub struct MockServer {
    loader: EndpointLoader,
    recorder: Recorder,
    kv: Arc<dyn KvStore>,
    snapshot: RwLock<Arc<Snapshot>>,
}

fn build_snapshot(
    loader: &EndpointLoader,
    kv: &Arc<dyn KvStore>,
    config: &MockServerConfig,
) -> Result<Snapshot, LoadError> {
    let settings = config.settings.clone();
    let endpoint_id_header = HeaderName::from_bytes(settings.endpoint_id_header.as_bytes())
        .map_err(|_| LoadError::InvalidEndpointIdHeader(settings.endpoint_id_header.clone()))?;

    let endpoints = loader.load(config)?;
    let ids = endpoints.iter().map(|e| e.id.clone()).collect();
    let mut templates = TemplateEngine::new(Arc::clone(kv), ids, settings.body_files_dir.clone());
    for endpoint in &endpoints {
        templates.compile(endpoint)?;
    }

    Ok(Snapshot {
        registry: EndpointRegistry::new(endpoints),
        templates,
        settings,
        endpoint_id_header,
    })
}

/// Response for a request no endpoint accepted.
fn not_found(detail: &MismatchDetail) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::NOT_FOUND,
        &json!({"error": "not_found", "message": detail.to_string()}),
    )
}

impl MockServer {
    /// Create a server over the given stores.
    ///
    /// Fails if any endpoint in `config` does not load; nothing is served
    /// from a partial registry.
    pub fn new(
        config: &MockServerConfig,
        store: Arc<dyn Matchstore>,
        kv: Arc<dyn KvStore>,
    ) -> Result<Self, LoadError> {
        let loader = EndpointLoader::new();
        let snapshot = build_snapshot(&loader, &kv, config)?;

        info!(
            mocks = config.mocks.len(),
            endpoints = snapshot.registry.len(),
            matches_count_only = store.has_matches_count_only(),
            mismatches_count_only = store.has_mismatches_count_only(),
            "Mock server initialized"
        );

        Ok(Self {
            loader,
            recorder: Recorder::new(store),
            kv,
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Create a server with in-memory stores sized from the settings.
    pub fn from_config(config: &MockServerConfig) -> Result<Self, LoadError> {
        let settings = &config.settings;
        let store = InMemoryMatchstore::new(MatchstoreOptions {
            matches_count_only: settings.matches_count_only,
            mismatches_count_only: settings.mismatches_count_only,
            max_matches_per_endpoint: settings.max_matches_per_endpoint,
            max_mismatches: settings.max_mismatches,
        });
        Self::new(config, Arc::new(store), Arc::new(InMemoryKvStore::new()))
    }

    /// Swap in endpoints from `config`.
    ///
    /// On error the current endpoints stay in place.
    pub async fn reload(&self, config: &MockServerConfig) -> Result<(), LoadError> {
        let snapshot = build_snapshot(&self.loader, &self.kv, config)?;
        let endpoints = snapshot.registry.len();
        *self.snapshot.write().await = Arc::new(snapshot);
        info!(endpoints, "Endpoints reloaded");
        Ok(())
    }

    async fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&*self.snapshot.read().await)
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Ids of the endpoints currently served.
    pub async fn endpoint_ids(&self) -> Vec<String> {
        self.current().await.registry.endpoint_ids()
    }

    /// Match `request` against the current endpoints.
    ///
    /// Not side-effect free: a mismatch is recorded before returning.
    pub async fn match_request(
        &self,
        request: &CapturedRequest,
    ) -> Result<MatchedRequest, MismatchDetail> {
        let snapshot = self.current().await;
        match self.match_in(&snapshot, request).await {
            MatchOutcome::Matched(result) => Ok(MatchedRequest { snapshot, result }),
            MatchOutcome::Mismatched(detail) => Err(detail),
        }
    }

    /// Render and record the response for a successful match.
    pub async fn respond(&self, request: &CapturedRequest, matched: MatchedRequest) -> Response<Full<Bytes>> {
        let MatchedRequest { snapshot, result } = matched;
        self.respond_in(&snapshot, request, result).await
    }

    async fn match_in(&self, snapshot: &Snapshot, request: &CapturedRequest) -> MatchOutcome {
        let outcome = Matcher::new(&snapshot.registry).find_match(request);

        if let MatchOutcome::Mismatched(detail) = &outcome {
            if snapshot.settings.log_mismatches {
                warn!(
                    method = %request.method,
                    path = %request.path,
                    reason = %detail,
                    "No matching endpoint found"
                );
            }
            if let Err(e) = self.recorder.record_mismatch(detail, request).await {
                warn!(error = %e, "Failed to record mismatch");
            }
        }

        outcome
    }

    async fn respond_in(
        &self,
        snapshot: &Snapshot,
        request: &CapturedRequest,
        matched: MatchResult,
    ) -> Response<Full<Bytes>> {
        let endpoint = Arc::clone(&matched.endpoint);
        if snapshot.settings.log_matches {
            info!(
                endpoint_id = %endpoint.id,
                mock = %endpoint.mock.name,
                method = %request.method,
                path = %request.path,
                "Request matched endpoint"
            );
        }

        let mut base = HeaderMap::new();
        match HeaderValue::from_str(&endpoint.id) {
            Ok(value) => {
                base.insert(snapshot.endpoint_id_header.clone(), value);
            }
            Err(_) => warn!(endpoint_id = %endpoint.id, "Endpoint id is not a valid header value"),
        }

        let data = ResponseTemplateData::new(request, &matched);
        let rendered = snapshot.templates.render(&endpoint, &data);
        let response = write_response(base, &endpoint.id, rendered);

        if let Err(e) = self
            .recorder
            .record_match(&endpoint.id, request, actual_response(&response))
            .await
        {
            warn!(endpoint_id = %endpoint.id, error = %e, "Failed to record match");
        }

        response
    }

    /// Serve one request: admin routes first, then endpoint matching.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Display,
    {
        let snapshot = self.current().await;

        if let Some(response) = admin::route(
            &snapshot.settings.admin_prefix,
            req.method(),
            req.uri().path(),
            self.recorder.store().as_ref(),
            &snapshot.registry,
        )
        .await
        {
            return response;
        }

        let request = CapturedRequest::capture(req).await;
        match self.match_in(&snapshot, &request).await {
            MatchOutcome::Matched(matched) => self.respond_in(&snapshot, &request, matched).await,
            MatchOutcome::Mismatched(detail) => not_found(&detail),
        }
    }

    /// Accept connections on `listener` until the task is dropped.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let address = listener.local_addr()?;
        info!(address = %address, "Mock server listening");

        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    continue;
                }
            };

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { Ok::<_, Infallible>(server.handle(req).await) }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(remote = %remote, error = %e, "Connection error");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use serde_json::Value;

    const CONFIG: &str = r#"
mocks:
  - name: fallthrough
    endpoints:
      - id: plain-a
        request:
          path: /a
        response:
          body: "A"
      - id: header-b
        priority: 1
        request:
          path: /a
          headers:
            X: "1"
        response:
          body: "B"

  - name: users
    endpoints:
      - id: get-user
        request:
          path: /users/{id}
        response:
          headers: |
            Content-Type: application/json
          body: '{"id": "{{RequestPathParams.id}}"}'
      - id: create-user
        request:
          method: POST
          path: /users
        response:
          status: "201"
          headers: |
            Location: /users/{{RequestBodyJSONData.id}}
          body: "{{kv_put (concat \"user-\" RequestBodyJSONData.id) RequestBody}}"
      - id: stored-user
        request:
          path: /stored/{id}
        response:
          body: '{{kv_lookup (concat "user-" RequestPathParams.id) "$.name"}}'
      - id: coded
        request:
          path: /coded
        response:
          status: "{{RequestQueryParams.code}}"
"#;

    fn server() -> MockServer {
        MockServer::from_config(&MockServerConfig::from_yaml(CONFIG).unwrap()).unwrap()
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::builder().uri(uri).body(Full::new(Bytes::new())).unwrap()
    }

    async fn body_text(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_priority_fallthrough_end_to_end() {
        let server = server();

        let with_header = Request::builder()
            .uri("/a")
            .header("X", "1")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = server.handle(with_header).await;
        assert_eq!(response.headers()["endpoint-id"], "header-b");
        assert_eq!(body_text(response).await, "B");

        let response = server.handle(get("/a")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["endpoint-id"], "plain-a");
        assert_eq!(body_text(response).await, "A");
    }

    #[tokio::test]
    async fn test_path_param_rendering_and_record() {
        let server = server();
        let response = server.handle(get("/users/7")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "application/json");
        assert_eq!(body_text(response).await, r#"{"id": "7"}"#);

        let matches = server.recorder().store().get_matches("get-user").await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].request.url, "/users/7");
        assert_eq!(matches[0].actual_response.status, 200);
        assert_eq!(matches[0].actual_response.headers["endpoint-id"], "get-user");
    }

    #[tokio::test]
    async fn test_backfill_uses_rendered_status() {
        let server = server();
        let create = Request::builder()
            .method("POST")
            .uri("/users")
            .body(Full::new(Bytes::from(r#"{"id":"9","name":"ann"}"#)))
            .unwrap();
        let response = server.handle(create).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["location"], "/users/9");

        let matches = server.recorder().store().get_matches("create-user").await.unwrap();
        assert_eq!(matches[0].actual_response.status, 201);
        assert_eq!(matches[0].actual_response.headers["location"], "/users/9");

        // The stored document is visible to later requests
        let response = server.handle(get("/stored/9")).await;
        assert_eq!(body_text(response).await, "ann");
    }

    #[tokio::test]
    async fn test_render_error_is_500_and_recorded() {
        let server = server();

        let response = server.handle(get("/coded?code=202")).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = server.handle(get("/coded?code=abc")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()["endpoint-id"], "coded");
        assert!(body_text(response).await.contains("failed to render status for endpoint 'coded'"));

        let statuses: Vec<u16> = server
            .recorder()
            .store()
            .get_matches("coded")
            .await
            .unwrap()
            .iter()
            .map(|m| m.actual_response.status)
            .collect();
        assert_eq!(statuses, vec![202, 500]);
    }

    #[tokio::test]
    async fn test_mismatch_is_404_and_recorded() {
        let server = server();
        let response = server.handle(get("/users/7/posts")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["error"], "not_found");
        assert!(body["message"]
            .as_str()
            .unwrap()
            .contains("path '/users/7/posts' not matched"));

        let mismatches = server.recorder().store().get_mismatches().await.unwrap();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].request.url, "/users/7/posts");
    }

    #[tokio::test]
    async fn test_count_only_matches() {
        let yaml = format!("settings:\n  matches_count_only: true\n{}", CONFIG);
        let server = MockServer::from_config(&MockServerConfig::from_yaml(&yaml).unwrap()).unwrap();

        for _ in 0..3 {
            server.handle(get("/a")).await;
        }
        server.handle(get("/nowhere")).await;

        let store = server.recorder().store();
        assert!(store.get_matches("plain-a").await.unwrap().is_empty());
        assert_eq!(store.get_matches_count("plain-a").await.unwrap(), 3);
        assert_eq!(store.get_mismatches().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_admin_routes_are_not_matched() {
        let server = server();
        server.handle(get("/users/1")).await;

        let response = server.handle(get("/__admin/matches/get-user/count")).await;
        assert_eq!(body_text(response).await, r#"{"count":1}"#);

        let response = server.handle(get("/__admin/endpoints")).await;
        let ids: Vec<String> = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(ids.len(), 6);
        assert!(ids.contains(&"coded".to_string()));

        assert_eq!(server.recorder().store().get_mismatches_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reload_swaps_endpoints() {
        let server = server();
        let next = MockServerConfig::from_yaml(
            r#"
mocks:
  - name: next
    endpoints:
      - id: only
        request:
          path: /only
        response:
          body: "only"
"#,
        )
        .unwrap();
        server.reload(&next).await.unwrap();
        assert_eq!(server.endpoint_ids().await, vec!["only".to_string()]);
        assert_eq!(server.handle(get("/a")).await.status(), StatusCode::NOT_FOUND);

        // A failed reload keeps what is being served
        let broken = MockServerConfig::from_yaml(
            r#"
mocks:
  - name: broken
    endpoints:
      - request:
          path: /x
          body: "("
"#,
        )
        .unwrap();
        assert!(server.reload(&broken).await.is_err());
        let response = server.handle(get("/only")).await;
        assert_eq!(body_text(response).await, "only");
    }

    #[tokio::test]
    async fn test_match_request_and_respond_pair() {
        let server = server();
        let (parts, _) = get("/users/3").into_parts();
        let request = CapturedRequest::from_parts(&parts, Some(Bytes::new()));

        let matched = server.match_request(&request).await.unwrap();
        assert_eq!(matched.result().path_params["id"], "3");
        let response = server.respond(&request, matched).await;
        assert_eq!(body_text(response).await, r#"{"id": "3"}"#);
    }

    #[tokio::test]
    async fn test_respond_uses_snapshot_of_match() {
        let server = MockServer::from_config(
            &MockServerConfig::from_yaml(
                r#"
mocks:
  - name: old
    endpoints:
      - id: teapot
        request:
          path: /x
        response:
          status: "418"
          body: "OLD"
"#,
            )
            .unwrap(),
        )
        .unwrap();
        let (parts, _) = get("/x").into_parts();
        let request = CapturedRequest::from_parts(&parts, Some(Bytes::new()));
        let matched = server.match_request(&request).await.unwrap();

        server
            .reload(&MockServerConfig::from_yaml("mocks: []").unwrap())
            .await
            .unwrap();

        let response = server.respond(&request, matched).await;
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(body_text(response).await, "OLD");

        let matches = server.recorder().store().get_matches("teapot").await.unwrap();
        assert_eq!(matches[0].actual_response.status, 418);

        let mismatch = server.match_request(&request).await.err().unwrap();
        assert!(mismatch.to_string().contains("path '/x' not matched"));
    }
}
