//! Hierarchical variable store.
//!
//! A [`State`] is one scope in a tree of scopes (run → host → script). Reads
//! fall back to the enclosing scope on a miss; writes always land in the
//! scope they were issued against, so scripts can shadow host and run values
//! without clobbering them.

mod pattern;

pub use pattern::{PatternError, has_placeholder, populate};

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

/// One scope in the state tree.
///
/// Scopes are shared (`Arc`) between the contexts that read them; interior
/// mutability keeps `set` usable from any worker thread.
#[derive(Debug)]
pub struct State {
  name: String,
  parent: Option<Arc<State>>,
  values: RwLock<BTreeMap<String, Value>>,
}

impl State {
  /// Create a root scope (the run scope).
  pub fn root() -> Arc<Self> {
    Arc::new(Self {
      name: "run".to_string(),
      parent: None,
      values: RwLock::new(BTreeMap::new()),
    })
  }

  /// Create a child scope. Lookups that miss the child fall back to `self`.
  pub fn child(self: &Arc<Self>, name: impl Into<String>) -> Arc<State> {
    Arc::new(State {
      name: name.into(),
      parent: Some(self.clone()),
      values: RwLock::new(BTreeMap::new()),
    })
  }

  /// Scope name, e.g. `run`, a host name, or `script:uid`.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Get a value. Dotted keys (`a.b.c`) traverse into object values. A miss
  /// in this scope searches enclosing scopes.
  pub fn get(&self, key: &str) -> Option<Value> {
    let (head, rest) = match key.split_once('.') {
      Some((head, rest)) => (head, Some(rest)),
      None => (key, None),
    };
    let local = {
      let values = self.values.read().expect("state lock poisoned");
      values.get(head).cloned()
    };
    match local {
      Some(value) => match rest {
        Some(path) => descend(&value, path),
        None => Some(value),
      },
      None => self.parent.as_ref().and_then(|p| p.get(key)),
    }
  }

  /// Whether `get` would find a value for `key`.
  pub fn has(&self, key: &str) -> bool {
    self.get(key).is_some()
  }

  /// Set a value in this scope. Dotted keys create intermediate objects.
  pub fn set(&self, key: &str, value: Value) {
    let mut values = self.values.write().expect("state lock poisoned");
    match key.split_once('.') {
      None => {
        values.insert(key.to_string(), value);
      }
      Some((head, rest)) => {
        let entry = values
          .entry(head.to_string())
          .or_insert_with(|| Value::Object(Default::default()));
        if !entry.is_object() {
          *entry = Value::Object(Default::default());
        }
        set_path(entry, rest, value);
      }
    }
  }

  /// Snapshot of this scope's own entries (no parent fallback).
  pub fn entries(&self) -> BTreeMap<String, Value> {
    self.values.read().expect("state lock poisoned").clone()
  }
}

fn descend(value: &Value, path: &str) -> Option<Value> {
  let mut current = value;
  for part in path.split('.') {
    current = current.get(part)?;
  }
  Some(current.clone())
}

fn set_path(target: &mut Value, path: &str, value: Value) {
  match path.split_once('.') {
    None => {
      if let Value::Object(map) = target {
        map.insert(path.to_string(), value);
      }
    }
    Some((head, rest)) => {
      if let Value::Object(map) = target {
        let entry = map
          .entry(head.to_string())
          .or_insert_with(|| Value::Object(Default::default()));
        if !entry.is_object() {
          *entry = Value::Object(Default::default());
        }
        set_path(entry, rest, value);
      }
    }
  }
}

/// Convert a string to a typed value where it parses as one.
///
/// Integers, floats, booleans, and JSON arrays/objects become their typed
/// representation; everything else stays a string.
pub fn convert_type(raw: &str) -> Value {
  let trimmed = raw.trim();
  if let Ok(i) = trimmed.parse::<i64>() {
    return Value::from(i);
  }
  if let Ok(f) = trimmed.parse::<f64>() {
    if f.is_finite() {
      return Value::from(f);
    }
  }
  if let Ok(b) = trimmed.parse::<bool>() {
    return Value::from(b);
  }
  if trimmed.starts_with('[') || trimmed.starts_with('{') {
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
      return v;
    }
  }
  Value::from(raw)
}

/// Render a value the way it appears in command arguments: strings bare,
/// everything else as JSON.
pub fn render(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn scope_fallback() {
    let run = State::root();
    run.set("greeting", json!("hello"));
    let host = run.child("host-a");
    let script = host.child("script:1");

    assert_eq!(script.get("greeting"), Some(json!("hello")));
    script.set("greeting", json!("hola"));
    assert_eq!(script.get("greeting"), Some(json!("hola")));
    assert_eq!(run.get("greeting"), Some(json!("hello")));
  }

  #[test]
  fn dotted_keys_traverse_objects() {
    let run = State::root();
    run.set("server.port", json!(8080));
    run.set("server.host", json!("db1"));
    assert_eq!(run.get("server.port"), Some(json!(8080)));
    assert_eq!(run.get("server"), Some(json!({"port": 8080, "host": "db1"})));
  }

  #[test]
  fn sibling_scopes_do_not_alias() {
    let run = State::root();
    let a = run.child("script:1");
    let b = run.child("script:2");
    a.set("x", json!(1));
    assert!(!b.has("x"));
  }

  #[test]
  fn convert_types() {
    assert_eq!(convert_type("12"), json!(12));
    assert_eq!(convert_type("1.5"), json!(1.5));
    assert_eq!(convert_type("true"), json!(true));
    assert_eq!(convert_type("[1,2]"), json!([1, 2]));
    assert_eq!(convert_type("plain"), json!("plain"));
  }
}
