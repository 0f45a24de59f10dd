//! Named script templates.

use std::fmt;

use crate::def::CmdDef;
use crate::graph::{CmdGraph, CmdId};

/// A named template graph. Scripts are shared, immutable, and never executed
/// directly: [`Script::resolve`] produces the per-context instance.
#[derive(Debug, Clone)]
pub struct Script {
  name: String,
  root: CmdDef,
}

impl Script {
  pub fn new(name: impl Into<String>) -> Self {
    let name = name.into();
    Self {
      root: CmdDef::new(crate::kind::CmdKind::NoOp { name: name.clone() }),
      name,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Append a step to the script's top-level sequence.
  pub fn then(mut self, command: CmdDef) -> Self {
    self.root = self.root.then(command);
    self
  }

  /// Attach a watcher to the script root.
  pub fn watch(mut self, watcher: CmdDef) -> Self {
    self.root = self.root.watch(watcher);
    self
  }

  /// The template subtree, used when grafting a script invocation.
  pub fn root_def(&self) -> &CmdDef {
    &self.root
  }

  /// Produce a fresh instance graph: new arena, new uids, identical
  /// topology. Two resolutions never share mutable state.
  pub fn resolve(&self) -> ResolvedScript {
    let mut graph = CmdGraph::new();
    let root = graph.instantiate(&self.root, None, None);
    ResolvedScript {
      name: self.name.clone(),
      graph,
      root,
    }
  }
}

impl fmt::Display for Script {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.name)
  }
}

/// One resolved instance of a script.
#[derive(Debug)]
pub struct ResolvedScript {
  pub name: String,
  pub graph: CmdGraph,
  pub root: CmdId,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn sample() -> Script {
    Script::new("setup")
      .then(CmdDef::sh("hostname").with("attempt", json!(0)))
      .then(CmdDef::signal("ready"))
  }

  #[test]
  fn resolve_copies_topology_with_fresh_uids() {
    let script = sample();
    let a = script.resolve();
    let b = script.resolve();

    assert_eq!(a.graph.len(), b.graph.len());
    let a_uids: Vec<u64> = a.graph.ids().map(|id| a.graph.node(id).uid()).collect();
    let b_uids: Vec<u64> = b.graph.ids().map(|id| b.graph.node(id).uid()).collect();
    assert!(a_uids.iter().all(|uid| !b_uids.contains(uid)));
  }

  #[test]
  fn resolved_instances_do_not_share_annotations() {
    let script = sample();
    let a = script.resolve();
    let b = script.resolve();
    let sh_a = a.graph.node(a.root).thens()[0];
    let sh_b = b.graph.node(b.root).thens()[0];

    a.graph.node(sh_a).set_annotation("attempt", json!(7));
    assert_eq!(a.graph.node(sh_a).annotation("attempt"), Some(json!(7)));
    assert_eq!(b.graph.node(sh_b).annotation("attempt"), Some(json!(0)));
  }
}
