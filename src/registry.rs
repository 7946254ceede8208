//! Endpoint registry.
//!
//! A prefix tree over path segments. Literal segments are stored under their
//! own text, `{name}` and `*` segments share the `*` child, and `**` segments
//! live under the `**` child. The tree is built once per load and only read
//! while serving requests.

use crate::endpoint::{MockEndpoint, PathSegment, MULTI_WILDCARD, WILDCARD};
use std::collections::HashMap;
use std::sync::Arc;

/// A node of the endpoint search trie.
#[derive(Debug, Default)]
pub struct EndpointSearchNode {
    children: HashMap<String, EndpointSearchNode>,
    /// Parameter names bound to this node by `{name}` segments
    param_names: Vec<String>,
    /// Endpoints terminating here, per method, highest priority first
    endpoints: HashMap<String, Vec<Arc<MockEndpoint>>>,
}

impl EndpointSearchNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an endpoint along its path segments.
    pub fn register(&mut self, endpoint: Arc<MockEndpoint>) {
        let mut node = self;
        for segment in &endpoint.request.segments {
            node = node.children.entry(segment.key().to_string()).or_default();
            if let PathSegment::Param(name) = segment {
                if !node.param_names.contains(name) {
                    node.param_names.push(name.clone());
                }
            }
        }

        let list = node
            .endpoints
            .entry(endpoint.request.method.clone())
            .or_default();
        let position = list
            .iter()
            .position(|existing| existing.priority < endpoint.priority)
            .unwrap_or(list.len());
        list.insert(position, endpoint);
    }

    /// Child for an exact literal segment. Reserved keys never match literally.
    pub fn literal_child(&self, segment: &str) -> Option<&EndpointSearchNode> {
        if segment == WILDCARD || segment == MULTI_WILDCARD {
            return None;
        }
        self.children.get(segment)
    }

    /// Single-segment wildcard child.
    pub fn wildcard_child(&self) -> Option<&EndpointSearchNode> {
        self.children.get(WILDCARD)
    }

    /// Multi-segment wildcard child.
    pub fn multi_wildcard_child(&self) -> Option<&EndpointSearchNode> {
        self.children.get(MULTI_WILDCARD)
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    /// Endpoints registered here for `method`, highest priority first.
    pub fn endpoints_for(&self, method: &str) -> Option<&[Arc<MockEndpoint>]> {
        self.endpoints.get(method).map(Vec::as_slice)
    }

    pub fn has_endpoints(&self) -> bool {
        !self.endpoints.is_empty()
    }
}

/// An immutable snapshot of all loaded endpoints.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    root: EndpointSearchNode,
    endpoints: Vec<Arc<MockEndpoint>>,
}

impl EndpointRegistry {
    /// Build a registry from endpoints in load order.
    pub fn new(endpoints: Vec<Arc<MockEndpoint>>) -> Self {
        let mut root = EndpointSearchNode::new();
        for endpoint in &endpoints {
            root.register(Arc::clone(endpoint));
        }
        Self { root, endpoints }
    }

    pub fn root(&self) -> &EndpointSearchNode {
        &self.root
    }

    pub fn endpoints(&self) -> &[Arc<MockEndpoint>] {
        &self.endpoints
    }

    pub fn get(&self, id: &str) -> Option<&Arc<MockEndpoint>> {
        self.endpoints.iter().find(|e| e.id == id)
    }

    pub fn endpoint_ids(&self) -> Vec<String> {
        self.endpoints.iter().map(|e| e.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
