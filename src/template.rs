//! Template engine for endpoint responses.
//!
//! Every endpoint gets three Handlebars templates (status, headers, body)
//! registered in one shared registry, so all of them see the same helper
//! namespace. Templates are compiled at load time and only read afterwards.

use crate::endpoint::MockEndpoint;
use crate::error::{LoadError, RenderError, RenderStage};
use crate::kvstore::KvStore;
use crate::matcher::MatchResult;
use crate::request::CapturedRequest;
use base64::Engine;
use handlebars::{
    handlebars_helper, Context, Handlebars, Helper, HelperDef, RenderContext, RenderErrorReason,
    ScopedJson,
};
use hyper::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Data every response template is rendered against.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResponseTemplateData {
    #[serde(rename = "RequestPathParams")]
    pub path_params: HashMap<String, String>,
    /// First value of each query parameter
    #[serde(rename = "RequestQueryParams")]
    pub query_params: HashMap<String, String>,
    #[serde(rename = "RequestBody")]
    pub body: String,
    /// Request body decoded as JSON, when it is JSON
    #[serde(rename = "RequestBodyJSONData")]
    pub body_json: Option<Value>,
    #[serde(rename = "RequestURL")]
    pub url: String,
    #[serde(rename = "RequestPath")]
    pub path: String,
    #[serde(rename = "RequestHost")]
    pub host: String,
    #[serde(rename = "RequestMethod")]
    pub method: String,
    /// First value of each header, lower-cased names
    #[serde(rename = "RequestHeaders")]
    pub headers: HashMap<String, String>,
}

impl ResponseTemplateData {
    pub fn new(request: &CapturedRequest, matched: &MatchResult) -> Self {
        let query_params = request
            .query_params()
            .into_iter()
            .filter_map(|(name, values)| values.into_iter().next().map(|v| (name, v)))
            .collect();
        let body = request.body_str().unwrap_or_default();
        let body_json = serde_json::from_str(&body).ok();

        Self {
            path_params: matched.path_params.clone(),
            query_params,
            body,
            body_json,
            url: request.url.clone(),
            path: request.path.clone(),
            host: request.host.clone().unwrap_or_default(),
            method: request.method.clone(),
            headers: request.flat_headers(),
        }
    }
}

/// Output of rendering one endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedResponse {
    pub status: StatusCode,
    /// Headers in the order the header block declared them
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Template engine for rendering endpoint responses.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
    body_files_dir: Option<PathBuf>,
}

fn template_name(endpoint_id: &str, stage: RenderStage) -> String {
    format!("{}#{}", endpoint_id, stage)
}

impl TemplateEngine {
    /// Create an engine with the full helper namespace.
    ///
    /// `endpoint_ids` backs the `endpoint_ids` helper; `kv` backs the `kv_*`
    /// helpers.
    pub fn new(
        kv: Arc<dyn KvStore>,
        endpoint_ids: Vec<String>,
        body_files_dir: Option<PathBuf>,
    ) -> Self {
        let mut handlebars = Handlebars::new();

        // Generic helpers
        handlebars.register_helper("json", Box::new(json_helper));
        handlebars.register_helper("to_json", Box::new(to_json_helper));
        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("random", Box::new(random_helper));
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));
        handlebars.register_helper("trim", Box::new(trim));
        handlebars.register_helper("replace", Box::new(replace));
        handlebars.register_helper("concat", Box::new(concat_helper));
        handlebars.register_helper("add_int", Box::new(add_int_helper));
        handlebars.register_helper("sub_int", Box::new(sub_int_helper));
        handlebars.register_helper("b64enc", Box::new(b64enc));
        handlebars.register_helper("b64dec", Box::new(b64dec_helper));

        // Store bindings
        for op in [KvOp::Get, KvOp::Put, KvOp::Add, KvOp::Remove, KvOp::Lookup] {
            handlebars.register_helper(
                op.helper_name(),
                Box::new(KvHelper {
                    op,
                    store: Arc::clone(&kv),
                }),
            );
        }
        handlebars.register_helper(
            "endpoint_ids",
            Box::new(EndpointIdsHelper {
                ids: Value::from(endpoint_ids),
            }),
        );

        // Don't escape HTML by default (we're not rendering HTML)
        handlebars.register_escape_fn(handlebars::no_escape);

        Self {
            handlebars,
            body_files_dir,
        }
    }

    /// Compile the status, headers and body templates of `endpoint`.
    ///
    /// Body files are read here, once.
    pub fn compile(&mut self, endpoint: &MockEndpoint) -> Result<(), LoadError> {
        let response = &endpoint.response;

        let body = match (&response.body, &response.body_file) {
            (Some(_), Some(_)) => {
                return Err(LoadError::BodyAndBodyFile {
                    endpoint_id: endpoint.id.clone(),
                })
            }
            (Some(body), None) => Some(body.clone()),
            (None, Some(file)) => {
                let path = match &self.body_files_dir {
                    Some(dir) => dir.join(file),
                    None => file.clone(),
                };
                let content =
                    std::fs::read_to_string(&path).map_err(|source| LoadError::BodyFile {
                        endpoint_id: endpoint.id.clone(),
                        path: path.clone(),
                        source,
                    })?;
                Some(content)
            }
            (None, None) => None,
        };

        self.register(endpoint, RenderStage::Status, &response.status)?;
        if let Some(headers) = &response.headers {
            self.register(endpoint, RenderStage::Headers, headers)?;
        }
        if let Some(body) = &body {
            self.register(endpoint, RenderStage::Body, body)?;
        }
        Ok(())
    }

    fn register(
        &mut self,
        endpoint: &MockEndpoint,
        stage: RenderStage,
        source: &str,
    ) -> Result<(), LoadError> {
        self.handlebars
            .register_template_string(&template_name(&endpoint.id, stage), source)
            .map_err(|source| LoadError::Template {
                endpoint_id: endpoint.id.clone(),
                stage,
                source: Box::new(source),
            })
    }

    fn render_stage(
        &self,
        endpoint: &MockEndpoint,
        stage: RenderStage,
        data: &ResponseTemplateData,
    ) -> Result<Option<String>, RenderError> {
        let name = template_name(&endpoint.id, stage);
        if !self.handlebars.has_template(&name) {
            return Ok(None);
        }
        self.handlebars
            .render(&name, data)
            .map(Some)
            .map_err(|e| RenderError::new(&endpoint.id, stage, e.to_string()))
    }

    /// Render headers, then status, then body.
    pub fn render(
        &self,
        endpoint: &MockEndpoint,
        data: &ResponseTemplateData,
    ) -> Result<RenderedResponse, RenderError> {
        let headers = match self.render_stage(endpoint, RenderStage::Headers, data)? {
            Some(block) => parse_header_block(&block)
                .map_err(|e| RenderError::new(&endpoint.id, RenderStage::Headers, e))?,
            None => Vec::new(),
        };

        // Every compiled endpoint has a status template
        let status_text = self
            .render_stage(endpoint, RenderStage::Status, data)?
            .ok_or_else(|| {
                RenderError::new(&endpoint.id, RenderStage::Status, "endpoint has no compiled templates")
            })?;
        let status = parse_status(&status_text)
            .map_err(|e| RenderError::new(&endpoint.id, RenderStage::Status, e))?;

        let body = self
            .render_stage(endpoint, RenderStage::Body, data)?
            .map(String::into_bytes)
            .unwrap_or_default();

        Ok(RenderedResponse {
            status,
            headers,
            body,
        })
    }
}

fn parse_status(text: &str) -> Result<StatusCode, String> {
    let trimmed = text.trim();
    let code: u16 = trimmed
        .parse()
        .map_err(|_| format!("'{}' is not a valid status code", trimmed))?;
    StatusCode::from_u16(code).map_err(|_| format!("'{}' is not a valid status code", trimmed))
}

/// Parse a rendered header block (a YAML map) into name/value pairs.
fn parse_header_block(block: &str) -> Result<Vec<(String, String)>, String> {
    if block.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mapping: serde_yaml::Mapping = serde_yaml::from_str(block)
        .map_err(|e| format!("header block is not a YAML map: {}", e))?;

    mapping
        .into_iter()
        .map(|(name, value)| {
            let name = scalar_to_string(name).ok_or("header names must be scalars")?;
            let value = scalar_to_string(value)
                .ok_or_else(|| format!("header '{}' must have a scalar value", name))?;
            Ok((name, value))
        })
        .collect()
}

fn scalar_to_string(value: serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        _ => None,
    }
}

/// Store operations exposed as helpers.
#[derive(Debug, Clone, Copy)]
enum KvOp {
    Get,
    Put,
    Add,
    Remove,
    Lookup,
}

impl KvOp {
    fn helper_name(&self) -> &'static str {
        match self {
            KvOp::Get => "kv_get",
            KvOp::Put => "kv_put",
            KvOp::Add => "kv_add",
            KvOp::Remove => "kv_remove",
            KvOp::Lookup => "kv_lookup",
        }
    }
}

struct KvHelper {
    op: KvOp,
    store: Arc<dyn KvStore>,
}

/// String form of parameter `idx`; JSON values are serialized.
fn string_param(h: &Helper, idx: usize, helper: &str) -> Result<String, handlebars::RenderError> {
    let value = h.param(idx).map(|p| p.value()).ok_or_else(|| {
        RenderErrorReason::Other(format!("{}: missing parameter {}", helper, idx + 1))
    })?;
    Ok(match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

impl HelperDef for KvHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, handlebars::RenderError> {
        let name = self.op.helper_name();
        let key = string_param(h, 0, name)?;
        let result = match self.op {
            KvOp::Get => self.store.get(&key),
            KvOp::Put => {
                let value = string_param(h, 1, name)?;
                self.store.put(&key, &value).map(|_| None)
            }
            KvOp::Add => {
                let path = string_param(h, 1, name)?;
                let value = string_param(h, 2, name)?;
                self.store.add(&key, &path, &value).map(|_| None)
            }
            KvOp::Remove => {
                let path = string_param(h, 1, name)?;
                self.store.remove(&key, &path).map(|_| None)
            }
            KvOp::Lookup => {
                let expression = string_param(h, 1, name)?;
                self.store.lookup(&key, &expression)
            }
        };

        match result {
            Ok(Some(value)) => Ok(ScopedJson::Derived(value)),
            Ok(None) => Ok(ScopedJson::Derived(match self.op {
                KvOp::Get | KvOp::Lookup => Value::Null,
                _ => Value::String(String::new()),
            })),
            Err(e) => Err(RenderErrorReason::Other(format!("{}: {}", name, e)).into()),
        }
    }
}

struct EndpointIdsHelper {
    ids: Value,
}

impl HelperDef for EndpointIdsHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        _: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, handlebars::RenderError> {
        Ok(ScopedJson::Derived(self.ids.clone()))
    }
}

// Custom Handlebars helpers

handlebars_helper!(trim: |s: str| s.trim());
handlebars_helper!(replace: |s: str, from: str, to: str| s.replace(from, to));
handlebars_helper!(b64enc: |s: str| base64::engine::general_purpose::STANDARD.encode(s));

/// Integer operands of a two-argument arithmetic helper.
fn int_params(h: &Helper, helper: &str) -> Result<(i64, i64), handlebars::RenderError> {
    let operand = |idx: usize| {
        h.param(idx).and_then(|p| p.value().as_i64()).ok_or_else(|| {
            RenderErrorReason::Other(format!("{}: parameter {} must be an integer", helper, idx + 1))
        })
    };
    Ok((operand(0)?, operand(1)?))
}

fn add_int_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let (a, b) = int_params(h, "add_int")?;
    let sum = a
        .checked_add(b)
        .ok_or_else(|| RenderErrorReason::Other(format!("add_int: {} + {} overflows", a, b)))?;
    out.write(&sum.to_string())?;
    Ok(())
}

fn sub_int_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let (a, b) = int_params(h, "sub_int")?;
    let difference = a
        .checked_sub(b)
        .ok_or_else(|| RenderErrorReason::Other(format!("sub_int: {} - {} overflows", a, b)))?;
    out.write(&difference.to_string())?;
    Ok(())
}

fn json_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let param = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    // Pretty print JSON
    if let Ok(json) = serde_json::from_str::<Value>(param) {
        out.write(&serde_json::to_string_pretty(&json).unwrap_or_default())?;
    } else {
        out.write(param)?;
    }
    Ok(())
}

fn to_json_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).map(|v| v.value().clone()).unwrap_or(Value::Null);
    out.write(&value.to_string())?;
    Ok(())
}

fn concat_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    for param in h.params() {
        match param.value() {
            Value::String(s) => out.write(s)?,
            Value::Null => {}
            other => out.write(&other.to_string())?,
        }
    }
    Ok(())
}

fn b64dec_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let param = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(param)
        .map_err(|e| RenderErrorReason::Other(format!("b64dec: {}", e)))?;
    out.write(&String::from_utf8_lossy(&decoded))?;
    Ok(())
}

fn uuid_helper(
    _: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let uuid = format!(
        "{:08x}-{:04x}-4{:03x}-{:04x}-{:012x}",
        rng.gen::<u32>(),
        rng.gen::<u16>(),
        rng.gen::<u16>() & 0x0fff,
        (rng.gen::<u16>() & 0x3fff) | 0x8000,
        rng.gen::<u64>() & 0xffffffffffff,
    );
    out.write(&uuid)?;
    Ok(())
}

fn now_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use chrono::Utc;

    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");

    let now = Utc::now();
    out.write(&now.format(format).to_string())?;
    Ok(())
}

fn random_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;

    let min = h.param(0).and_then(|v| v.value().as_i64()).unwrap_or(0);
    let max = h.param(1).and_then(|v| v.value().as_i64()).unwrap_or(100);
    if max < min {
        return Err(RenderErrorReason::Other(format!("random: {} > {}", min, max)).into());
    }

    let mut rng = rand::thread_rng();
    let value = rng.gen_range(min..=max);
    out.write(&value.to_string())?;
    Ok(())
}

fn default_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).map(|v| v.value());
    let default = h.param(1).and_then(|v| v.value().as_str()).unwrap_or("");

    match value {
        Some(Value::String(s)) if !s.is_empty() => out.write(s)?,
        Some(v) if !v.is_null() && !v.is_string() => out.write(&v.to_string())?,
        _ => out.write(default)?,
    }
    Ok(())
}

fn upper_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_lowercase())?;
    Ok(())
}
