//! Response writer.
//!
//! Applies a rendered response on top of headers already set for the match
//! (such as the endpoint id header) and captures what was actually sent so
//! the match record can reflect it.

use crate::error::{RenderError, RenderStage};
use crate::matchstore::ActualResponse;
use crate::template::RenderedResponse;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{HeaderMap, Response, StatusCode};
use serde::Serialize;
use std::collections::HashMap;
use tracing::error;

/// Build an HTTP response from parts that are already validated.
pub fn build_response(
    status: StatusCode,
    headers: HeaderMap,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Serialize `value` as a JSON response.
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            build_response(status, headers, body)
        }
        Err(e) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            HeaderMap::new(),
            format!("failed to serialize response: {}", e),
        ),
    }
}

/// Plain-text response on top of `headers`.
pub fn text_response(
    status: StatusCode,
    mut headers: HeaderMap,
    body: impl Into<String>,
) -> Response<Full<Bytes>> {
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    build_response(status, headers, body.into())
}

/// Add the rendered headers to `base`, keeping anything already there.
fn apply_headers(
    base: &mut HeaderMap,
    endpoint_id: &str,
    headers: &[(String, String)],
) -> Result<(), RenderError> {
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            RenderError::new(endpoint_id, RenderStage::Headers, format!("invalid header name '{}'", name))
        })?;
        let value = HeaderValue::from_str(value).map_err(|_| {
            RenderError::new(
                endpoint_id,
                RenderStage::Headers,
                format!("invalid value for header '{}'", name),
            )
        })?;
        base.append(name, value);
    }
    Ok(())
}

/// Turn the outcome of rendering into the response to send.
///
/// A render failure becomes a 500 whose body names the failing stage.
pub fn write_response(
    base: HeaderMap,
    endpoint_id: &str,
    rendered: Result<RenderedResponse, RenderError>,
) -> Response<Full<Bytes>> {
    let mut headers = base.clone();
    let result = rendered.and_then(|rendered| {
        apply_headers(&mut headers, endpoint_id, &rendered.headers)?;
        Ok(rendered)
    });

    match result {
        Ok(rendered) => build_response(rendered.status, headers, rendered.body),
        Err(e) => {
            error!(endpoint_id = %endpoint_id, stage = %e.stage, error = %e.message, "Failed to render response");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, base, e.to_string())
        }
    }
}

/// Status and headers of a response, for the match record.
pub fn actual_response<B>(response: &Response<B>) -> ActualResponse {
    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in response.headers() {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    ActualResponse {
        status: response.status().as_u16(),
        headers,
    }
}
