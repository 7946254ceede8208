//! Buffered view of an incoming request.
//!
//! The body is read once into [`Bytes`] before any predicate runs, so body
//! matching, template data and match records all share the same bytes.

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::{HeaderMap, Request};
use std::collections::HashMap;
use tracing::warn;

/// An incoming request with its body already buffered.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    /// Upper-cased method
    pub method: String,
    /// Full request target as received (path and query)
    pub url: String,
    pub path: String,
    pub query: Option<String>,
    pub scheme: String,
    pub host: Option<String>,
    pub headers: HeaderMap,
    /// `None` when the body could not be read
    pub body: Option<Bytes>,
}

impl CapturedRequest {
    /// Build a captured request from parts and an already-buffered body.
    pub fn from_parts(parts: &http::request::Parts, body: Option<Bytes>) -> Self {
        let uri = &parts.uri;
        let host = parts
            .headers
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|a| a.to_string()));

        Self {
            method: parts.method.as_str().to_uppercase(),
            url: uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| uri.path().to_string()),
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            scheme: uri.scheme_str().unwrap_or("http").to_lowercase(),
            host,
            headers: parts.headers.clone(),
            body,
        }
    }

    /// Buffer the body of `req` and capture it.
    pub async fn capture<B>(req: Request<B>) -> Self
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => Some(collected.to_bytes()),
            Err(e) => {
                warn!(path = %parts.uri.path(), error = %e, "Failed to read request body");
                None
            }
        };
        Self::from_parts(&parts, body)
    }

    /// Query parameters, each name mapped to all of its values in order.
    pub fn query_params(&self) -> HashMap<String, Vec<String>> {
        parse_query_string(self.query.as_deref().unwrap_or(""))
    }

    /// Host without a port, lower-cased.
    pub fn host_name(&self) -> Option<String> {
        self.host.as_deref().map(|h| strip_port(h).to_lowercase())
    }

    /// Body as text, if present.
    pub fn body_str(&self) -> Option<String> {
        self.body
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Headers flattened to their first value, names lower-cased.
    pub fn flat_headers(&self) -> HashMap<String, String> {
        let mut flat = HashMap::new();
        for (name, value) in &self.headers {
            if let Ok(value) = value.to_str() {
                flat.entry(name.as_str().to_string())
                    .or_insert_with(|| value.to_string());
            }
        }
        flat
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // [::1]:8080
        return host.find(']').map(|end| &host[..=end]).unwrap_or(host);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Parse a query string into name/values pairs.
pub fn parse_query_string(query: &str) -> HashMap<String, Vec<String>> {
    let mut params: HashMap<String, Vec<String>> = HashMap::new();

    for part in query.split('&') {
        if part.is_empty() {
            continue;
        }
        let (key, value) = part.split_once('=').unwrap_or((part, ""));
        params
            .entry(urlencoding_decode(key))
            .or_default()
            .push(urlencoding_decode(value));
    }

    params
}

/// Percent-decoding with `+` as space. Invalid escapes are kept verbatim.
fn urlencoding_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        result.push(byte);
                        i += 3;
                    }
                    None => {
                        result.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                result.push(b' ');
                i += 1;
            }
            b => {
                result.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&result).into_owned()
}
