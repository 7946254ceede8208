//! Key-value store bindings for templates.
//!
//! Templates reach the store through the [`KvStore`] trait only, so the host
//! can plug in a local map or a remote store without the rendering pipeline
//! knowing. Documents are JSON values addressed by key.

use crate::error::KvError;
use jsonpath_rust::JsonPath;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

/// Store operations exposed to templates.
///
/// Missing keys are never an error: reads return `None` and removals are
/// no-ops. Calls may happen several times per request.
pub trait KvStore: Send + Sync {
    /// Value stored at `key`.
    fn get(&self, key: &str) -> Result<Option<Value>, KvError>;

    /// Replace the value at `key` with the parsed JSON `value`.
    fn put(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Add `value` at the JSON pointer `path` inside the document at `key`.
    fn add(&self, key: &str, path: &str, value: &str) -> Result<(), KvError>;

    /// Remove whatever sits at the JSON pointer `path` inside `key`.
    fn remove(&self, key: &str, path: &str) -> Result<(), KvError>;

    /// Evaluate a JSONPath expression against the document at `key`.
    fn lookup(&self, key: &str, expression: &str) -> Result<Option<Value>, KvError>;
}

/// Process-local [`KvStore`].
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    data: RwLock<HashMap<String, Value>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Parse a value argument; bare text that is not JSON is kept as a string.
fn parse_value(value: &str) -> Value {
    serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()))
}

fn pointer_tokens(path: &str) -> Result<Vec<String>, KvError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    if !path.starts_with('/') {
        return Err(KvError::InvalidPointer(path.to_string()));
    }
    Ok(path[1..]
        .split('/')
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect())
}

/// Parent pointer of `tokens` and the last token, if any.
fn split_last(tokens: &[String]) -> Option<(String, &str)> {
    let (last, parent) = tokens.split_last()?;
    let parent = parent
        .iter()
        .map(|t| format!("/{}", t.replace('~', "~0").replace('/', "~1")))
        .collect::<String>();
    Some((parent, last.as_str()))
}

/// JSON-patch style `add` on `doc`.
fn add_at(doc: &mut Value, path: &str, value: Value) -> Result<(), KvError> {
    let tokens = pointer_tokens(path)?;
    let Some((parent_path, last)) = split_last(&tokens) else {
        *doc = value;
        return Ok(());
    };

    let parent = doc
        .pointer_mut(&parent_path)
        .ok_or_else(|| KvError::InvalidPointer(path.to_string()))?;
    match parent {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
        }
        Value::Array(items) => {
            if last == "-" {
                items.push(value);
            } else {
                let index: usize = last
                    .parse()
                    .map_err(|_| KvError::InvalidPointer(path.to_string()))?;
                if index > items.len() {
                    return Err(KvError::InvalidPointer(path.to_string()));
                }
                items.insert(index, value);
            }
        }
        _ => return Err(KvError::InvalidPointer(path.to_string())),
    }
    Ok(())
}

/// Remove the element at `path`; missing targets are ignored.
fn remove_at(doc: &mut Value, path: &str) -> Result<(), KvError> {
    let tokens = pointer_tokens(path)?;
    let Some((parent_path, last)) = split_last(&tokens) else {
        *doc = Value::Null;
        return Ok(());
    };

    match doc.pointer_mut(&parent_path) {
        Some(Value::Object(map)) => {
            map.remove(last);
        }
        Some(Value::Array(items)) => {
            if let Ok(index) = last.parse::<usize>() {
                if index < items.len() {
                    items.remove(index);
                }
            }
        }
        _ => {}
    }
    Ok(())
}

impl KvStore for InMemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<Value>, KvError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.data.write().insert(key.to_string(), parse_value(value));
        Ok(())
    }

    fn add(&self, key: &str, path: &str, value: &str) -> Result<(), KvError> {
        let mut data = self.data.write();
        let doc = data
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        add_at(doc, path, parse_value(value))
    }

    fn remove(&self, key: &str, path: &str) -> Result<(), KvError> {
        let mut data = self.data.write();
        match data.get_mut(key) {
            Some(doc) => remove_at(doc, path),
            None => Ok(()),
        }
    }

    fn lookup(&self, key: &str, expression: &str) -> Result<Option<Value>, KvError> {
        let Some(doc) = self.get(key)? else {
            return Ok(None);
        };

        let path = JsonPath::try_from(expression).map_err(|e| {
            KvError::InvalidPathExpression(expression.to_string(), e.to_string())
        })?;

        Ok(match path.find(&doc) {
            Value::Array(mut results) if results.len() == 1 => results.pop(),
            Value::Array(results) if results.is_empty() => None,
            Value::Null => None,
            other => Some(other),
        })
    }
}
