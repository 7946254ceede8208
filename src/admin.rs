//! Admin routes for reading and clearing match history.
//!
//! Served under a configurable prefix and dispatched before endpoint
//! matching, so admin requests are never recorded as mismatches.

use crate::error::MatchstoreError;
use crate::matchstore::Matchstore;
use crate::registry::EndpointRegistry;
use crate::response::json_response;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Response, StatusCode};
use serde_json::json;
use tracing::{debug, warn};

/// Parsed admin route, relative to the prefix.
#[derive(Debug, PartialEq, Eq)]
enum AdminRoute<'a> {
    /// GET matches/:endpoint_id
    Matches(&'a str),
    /// GET matches/:endpoint_id/count
    MatchesCount(&'a str),
    /// DELETE matches
    DeleteMatches,
    /// GET mismatches
    Mismatches,
    /// GET mismatches/count
    MismatchesCount,
    /// DELETE mismatches
    DeleteMismatches,
    /// GET endpoints
    Endpoints,
}

impl<'a> AdminRoute<'a> {
    fn parse(method: &Method, segments: &[&'a str]) -> Option<Self> {
        match (method, segments) {
            (&Method::GET, ["matches", id]) => Some(AdminRoute::Matches(*id)),
            (&Method::GET, ["matches", id, "count"]) => Some(AdminRoute::MatchesCount(*id)),
            (&Method::DELETE, ["matches"]) => Some(AdminRoute::DeleteMatches),
            (&Method::GET, ["mismatches"]) => Some(AdminRoute::Mismatches),
            (&Method::GET, ["mismatches", "count"]) => Some(AdminRoute::MismatchesCount),
            (&Method::DELETE, ["mismatches"]) => Some(AdminRoute::DeleteMismatches),
            (&Method::GET, ["endpoints"]) => Some(AdminRoute::Endpoints),
            _ => None,
        }
    }
}

/// Path below `prefix`, or `None` if `path` is not an admin path.
fn strip_admin_prefix<'a>(prefix: &str, path: &'a str) -> Option<&'a str> {
    if prefix.is_empty() {
        return None;
    }
    let rest = path.strip_prefix(prefix.trim_end_matches('/'))?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest.trim_matches('/'))
    } else {
        None
    }
}

pub fn not_found() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::NOT_FOUND,
        &json!({"error": "not_found", "message": "unknown admin route"}),
    )
}

fn store_error(e: MatchstoreError) -> Response<Full<Bytes>> {
    warn!(error = %e, "Matchstore request failed");
    json_response(
        StatusCode::SERVICE_UNAVAILABLE,
        &json!({"error": "matchstore_unavailable", "message": e.to_string()}),
    )
}

/// Serve `path` if it falls under `prefix`.
///
/// Returns `None` for non-admin paths so the caller can go on to endpoint
/// matching.
pub async fn route(
    prefix: &str,
    method: &Method,
    path: &str,
    store: &dyn Matchstore,
    registry: &EndpointRegistry,
) -> Option<Response<Full<Bytes>>> {
    let rest = strip_admin_prefix(prefix, path)?;
    debug!(method = %method, path = %path, "Admin request");

    let segments: Vec<&str> = if rest.is_empty() {
        Vec::new()
    } else {
        rest.split('/').collect()
    };
    let Some(admin_route) = AdminRoute::parse(method, &segments) else {
        return Some(not_found());
    };

    let response = match admin_route {
        AdminRoute::Matches(id) => match store.get_matches(id).await {
            Ok(matches) => json_response(StatusCode::OK, &matches),
            Err(e) => store_error(e),
        },
        AdminRoute::MatchesCount(id) => match store.get_matches_count(id).await {
            Ok(count) => json_response(StatusCode::OK, &json!({ "count": count })),
            Err(e) => store_error(e),
        },
        AdminRoute::DeleteMatches => match store.delete_matches().await {
            Ok(()) => json_response(StatusCode::OK, &json!({ "deleted": "matches" })),
            Err(e) => store_error(e),
        },
        AdminRoute::Mismatches => match store.get_mismatches().await {
            Ok(mismatches) => json_response(StatusCode::OK, &mismatches),
            Err(e) => store_error(e),
        },
        AdminRoute::MismatchesCount => match store.get_mismatches_count().await {
            Ok(count) => json_response(StatusCode::OK, &json!({ "count": count })),
            Err(e) => store_error(e),
        },
        AdminRoute::DeleteMismatches => match store.delete_mismatches().await {
            Ok(()) => json_response(StatusCode::OK, &json!({ "deleted": "mismatches" })),
            Err(e) => store_error(e),
        },
        AdminRoute::Endpoints => json_response(StatusCode::OK, &registry.endpoint_ids()),
    };
    Some(response)
}
