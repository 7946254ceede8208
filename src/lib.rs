//! Mock Endpoint Server
//!
//! A programmable HTTP mock server. Endpoints are declared in YAML, matched
//! through a path trie plus secondary predicates, and answered with
//! Handlebars-rendered responses. Every match and mismatch is recorded so
//! tests can assert on the traffic a system under test produced.
//!
//! # Features
//!
//! - **Path Matching**: Literal segments, `*`, `**` and `{name}` parameters
//! - **Request Predicates**: Scheme, host, query, headers and body regex
//! - **Priorities**: Higher priority endpoints win on the same path and method
//! - **Dynamic Templates**: Status, headers and body rendered per request
//! - **KV Store**: Templates can read and write JSON documents across requests
//! - **Match History**: Full records or counts only, with mismatch diagnostics
//! - **Hot Reload**: Swap endpoint definitions without dropping requests
//!
//! # Example Configuration
//!
//! ```yaml
//! mocks:
//!   - name: users
//!     endpoints:
//!       - id: get-user
//!         request:
//!           method: GET
//!           path: /users/{id}
//!         response:
//!           headers: |
//!             Content-Type: application/json
//!           body: '{"id": "{{RequestPathParams.id}}"}'
//! ```

pub mod admin;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod kvstore;
pub mod matcher;
pub mod matchstore;
pub mod recorder;
pub mod registry;
pub mod request;
pub mod response;
pub mod server;
pub mod template;

pub use config::MockServerConfig;
pub use server::MockServer;
