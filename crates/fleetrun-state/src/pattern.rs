//! `${{name:default}}` placeholder substitution.
//!
//! Command arguments are populated against the state chain before the
//! command activates. A missing name with a default after `:` takes the
//! default; a missing name with no default leaves the placeholder in place
//! and is reported so the caller can decide whether that is fatal.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::{State, render};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"\$\{\{(?<name>[^${}:]+)(?<sep>:?)(?<default>[^}]*)\}\}").expect("placeholder regex")
});

/// Substitution failed to resolve one or more names.
#[derive(Debug, thiserror::Error)]
#[error("unresolved placeholders {missing:?} in '{result}'")]
pub struct PatternError {
  /// The partially substituted text, unresolved placeholders intact.
  pub result: String,
  /// The names that had no value and no default.
  pub missing: Vec<String>,
}

/// Whether `input` still contains a `${{…}}` placeholder.
pub fn has_placeholder(input: &str) -> bool {
  PLACEHOLDER.is_match(input)
}

/// Replace every `${{name:default}}` in `input` from `state`, with an
/// optional override lookup consulted first (command annotations).
pub fn populate(
  input: &str,
  state: &State,
  overrides: impl Fn(&str) -> Option<Value>,
) -> Result<String, PatternError> {
  if !has_placeholder(input) {
    return Ok(input.to_string());
  }
  let mut missing = Vec::new();
  let result = PLACEHOLDER
    .replace_all(input, |caps: &regex::Captures<'_>| {
      let name = caps["name"].trim().to_string();
      let value = overrides(&name).or_else(|| state.get(&name));
      match value {
        Some(v) => render(&v),
        None if &caps["sep"] == ":" => caps["default"].to_string(),
        None => {
          missing.push(name);
          caps[0].to_string()
        }
      }
    })
    .into_owned();
  if missing.is_empty() {
    Ok(result)
  } else {
    Err(PatternError { result, missing })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn no_overrides(_: &str) -> Option<Value> {
    None
  }

  #[test]
  fn substitutes_from_state() {
    let state = State::root();
    state.set("host", json!("db1"));
    state.set("port", json!(5432));
    let out = populate("psql -h ${{host}} -p ${{port}}", &state, no_overrides).unwrap();
    assert_eq!(out, "psql -h db1 -p 5432");
  }

  #[test]
  fn default_applies_on_miss() {
    let state = State::root();
    let out = populate("sleep ${{DELAY:5s}}", &state, no_overrides).unwrap();
    assert_eq!(out, "sleep 5s");
  }

  #[test]
  fn missing_without_default_is_reported() {
    let state = State::root();
    let err = populate("echo ${{absent}}", &state, no_overrides).unwrap_err();
    assert_eq!(err.missing, vec!["absent".to_string()]);
    assert_eq!(err.result, "echo ${{absent}}");
  }

  #[test]
  fn overrides_win_over_state() {
    let state = State::root();
    state.set("it", json!("state"));
    let out = populate("${{it}}", &state, |name| {
      (name == "it").then(|| json!("override"))
    })
    .unwrap();
    assert_eq!(out, "override");
  }
}
