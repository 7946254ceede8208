//! Configuration for the mock server.
//!
//! Defines global settings, mock groups and the endpoint definitions they
//! contain. Definitions are plain data here; [`crate::endpoint`] compiles them.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Main configuration for the mock server.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MockServerConfig {
    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,

    /// Additional files holding `mocks:` lists, relative to the config file
    #[serde(default)]
    pub mock_files: Vec<PathBuf>,

    /// Inline mock definitions
    #[serde(default)]
    pub mocks: Vec<MockDefinition>,
}

/// Shape of a file listed in `mock_files`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MockFile {
    #[serde(default)]
    mocks: Vec<MockDefinition>,
}

impl MockServerConfig {
    /// Load configuration from a YAML file, pulling in any `mock_files`.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yaml::from_str(&content)?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for file in &config.mock_files {
            let file_path = base.join(file);
            let content = std::fs::read_to_string(&file_path).map_err(|e| {
                anyhow::anyhow!("Failed to read mock file {}: {}", file_path.display(), e)
            })?;
            let parsed: MockFile = serde_yaml::from_str(&content).map_err(|e| {
                anyhow::anyhow!("Failed to parse mock file {}: {}", file_path.display(), e)
            })?;
            config.mocks.extend(parsed.mocks);
        }

        if let Some(dir) = &config.settings.body_files_dir {
            if dir.is_relative() {
                config.settings.body_files_dir = Some(base.join(dir));
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string. `mock_files` are not resolved.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if hyper::header::HeaderName::from_bytes(self.settings.endpoint_id_header.as_bytes()).is_err() {
            anyhow::bail!(
                "Invalid endpoint_id_header '{}'",
                self.settings.endpoint_id_header
            );
        }

        let mut seen = HashSet::new();
        for (i, mock) in self.mocks.iter().enumerate() {
            mock.validate()
                .map_err(|e| anyhow::anyhow!("Mock {}: {}", i, e))?;
            for endpoint in &mock.endpoints {
                if let Some(id) = &endpoint.id {
                    if !seen.insert(id.as_str()) {
                        anyhow::bail!("Duplicate endpoint id '{}'", id);
                    }
                }
            }
        }
        Ok(())
    }

    /// Total number of endpoint definitions across all mocks.
    pub fn endpoint_count(&self) -> usize {
        self.mocks.iter().map(|m| m.endpoints.len()).sum()
    }
}

/// A named group of endpoints loaded from one definition source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockDefinition {
    /// Name of the mock
    pub name: String,

    /// Endpoints belonging to this mock
    #[serde(default)]
    pub endpoints: Vec<EndpointDefinition>,
}

impl MockDefinition {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Mock name cannot be empty");
        }
        for (i, endpoint) in self.endpoints.iter().enumerate() {
            endpoint
                .validate()
                .map_err(|e| anyhow::anyhow!("Endpoint {}: {}", i, e))?;
        }
        Ok(())
    }
}

/// A single endpoint definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointDefinition {
    /// Unique identifier (generated when omitted)
    #[serde(default)]
    pub id: Option<String>,

    /// Priority (higher wins among endpoints sharing a path and method)
    #[serde(default)]
    pub priority: i64,

    /// Request predicate
    pub request: RequestDefinition,

    /// Response templates
    #[serde(default)]
    pub response: ResponseDefinition,
}

impl EndpointDefinition {
    pub fn validate(&self) -> anyhow::Result<()> {
        if matches!(&self.id, Some(id) if id.is_empty()) {
            anyhow::bail!("Endpoint id cannot be empty");
        }
        self.request.validate()?;
        self.response.validate()?;
        Ok(())
    }
}

/// Request matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestDefinition {
    /// Required URL scheme (http/https)
    #[serde(default)]
    pub scheme: Option<String>,

    /// Required host
    #[serde(default)]
    pub host: Option<String>,

    /// HTTP method
    #[serde(default = "default_method")]
    pub method: String,

    /// Path pattern with `{name}`, `*` and `**` segments
    pub path: String,

    /// Query parameters that must be present with these values
    #[serde(default)]
    pub query: HashMap<String, String>,

    /// Headers that must be present with these values
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Regex the raw request body must match
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl RequestDefinition {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.path.starts_with('/') {
            anyhow::bail!("Path must begin with '/': {}", self.path);
        }
        if self.method.trim().is_empty() {
            anyhow::bail!("Method cannot be empty");
        }
        Ok(())
    }
}

/// Response template sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseDefinition {
    /// Status code template
    #[serde(default = "default_status")]
    pub status: String,

    /// Header block template, rendering to a YAML map
    #[serde(default)]
    pub headers: Option<String>,

    /// Inline body template
    #[serde(default)]
    pub body: Option<String>,

    /// Body template file, relative to `settings.body_files_dir`
    #[serde(default)]
    pub body_file: Option<PathBuf>,
}

fn default_status() -> String {
    "200".to_string()
}

impl Default for ResponseDefinition {
    fn default() -> Self {
        Self {
            status: default_status(),
            headers: None,
            body: None,
            body_file: None,
        }
    }
}

impl ResponseDefinition {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.body.is_some() && self.body_file.is_some() {
            anyhow::bail!("Response cannot declare both body and body_file");
        }
        Ok(())
    }
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Listen address for the mock listener
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Base directory for response body files
    #[serde(default)]
    pub body_files_dir: Option<PathBuf>,

    /// Only count matches, don't keep the records
    #[serde(default)]
    pub matches_count_only: bool,

    /// Only count mismatches, don't keep the records
    #[serde(default)]
    pub mismatches_count_only: bool,

    /// Matches retained per endpoint (0 = unbounded)
    #[serde(default = "default_capacity")]
    pub max_matches_per_endpoint: usize,

    /// Mismatches retained (0 = unbounded)
    #[serde(default = "default_capacity")]
    pub max_mismatches: usize,

    /// Header carrying the matched endpoint id
    #[serde(default = "default_endpoint_id_header")]
    pub endpoint_id_header: String,

    /// Path prefix of the admin routes (empty disables them)
    #[serde(default = "default_admin_prefix")]
    pub admin_prefix: String,

    /// Log matched requests
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log unmatched requests
    #[serde(default = "default_true")]
    pub log_mismatches: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            body_files_dir: None,
            matches_count_only: false,
            mismatches_count_only: false,
            max_matches_per_endpoint: default_capacity(),
            max_mismatches: default_capacity(),
            endpoint_id_header: default_endpoint_id_header(),
            admin_prefix: default_admin_prefix(),
            log_matches: true,
            log_mismatches: true,
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_capacity() -> usize {
    100
}

fn default_endpoint_id_header() -> String {
    "endpoint-id".to_string()
}

fn default_admin_prefix() -> String {
    "/__admin".to_string()
}

fn default_true() -> bool {
    true
}

/// Example configuration printed by `--print-config`.
pub const EXAMPLE_CONFIG: &str = r#"settings:
  listen: 127.0.0.1:8080
  matches_count_only: false
  mismatches_count_only: false
  max_matches_per_endpoint: 100
  max_mismatches: 100

mocks:
  - name: users
    endpoints:
      - id: get-user
        request:
          method: GET
          path: /users/{id}
        response:
          headers: |
            Content-Type: application/json
          body: '{"id": "{{RequestPathParams.id}}"}'

      - id: create-user
        priority: 10
        request:
          method: POST
          path: /users
          headers:
            Content-Type: application/json
          body: '"name"'
        response:
          status: "201"
          body: '{{kv_put (concat "user-" RequestBodyJSONData.name) RequestBody}}created'
"#;
