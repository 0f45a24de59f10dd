//! Instantiated command nodes.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;

use crate::graph::CmdId;
use crate::kind::CmdKind;

static UID_GENERATOR: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_uid() -> u64 {
  UID_GENERATOR.fetch_add(1, Ordering::Relaxed)
}

/// Per-instance mutable state of a node.
///
/// Everything that changes while a node executes lives here, behind the
/// node's own lock, so two instances of the same template never alias.
#[derive(Debug, Default)]
pub struct NodeState {
  /// Output of the node's most recent resolution.
  pub output: Option<Value>,
  /// Active annotations; seeded from the template defaults, updated by loop
  /// controllers binding their iteration element.
  pub with: BTreeMap<String, Value>,
  /// Loop controllers: the sequence being iterated.
  pub loop_items: Vec<Value>,
  /// Loop controllers: index of the element bound by the last activation.
  pub loop_index: Option<usize>,
  /// Loop controllers: the raw input the items were split from, used to
  /// detect when a new sequence should be loaded.
  pub loaded_input: Option<String>,
}

/// One command node in an instance graph.
#[derive(Debug)]
pub struct Cmd {
  pub(crate) uid: u64,
  pub(crate) kind: CmdKind,
  /// Structural parent: the node whose then-chain contains this node.
  /// Watcher and timer roots have no structural parent, so their branches
  /// end instead of continuing into the owner's chain.
  pub(crate) parent: Option<CmdId>,
  /// Annotation parent: watcher/timer roots still see their owner's
  /// annotations through this link.
  pub(crate) state_parent: Option<CmdId>,
  pub(crate) thens: Vec<CmdId>,
  pub(crate) watchers: Vec<CmdId>,
  pub(crate) timers: Vec<(Duration, CmdId)>,
  /// Loop splice: forces `next` regardless of children/siblings.
  pub(crate) next_override: Option<CmdId>,
  pub(crate) state: Mutex<NodeState>,
}

impl Cmd {
  pub fn uid(&self) -> u64 {
    self.uid
  }

  pub fn kind(&self) -> &CmdKind {
    &self.kind
  }

  pub fn thens(&self) -> &[CmdId] {
    &self.thens
  }

  pub fn watchers(&self) -> &[CmdId] {
    &self.watchers
  }

  pub fn timers(&self) -> &[(Duration, CmdId)] {
    &self.timers
  }

  pub fn has_watchers(&self) -> bool {
    !self.watchers.is_empty()
  }

  pub fn has_timers(&self) -> bool {
    !self.timers.is_empty()
  }

  /// Read a field of the node's mutable state.
  pub fn with_state<T>(&self, f: impl FnOnce(&mut NodeState) -> T) -> T {
    let mut state = self.state.lock().expect("node state lock poisoned");
    f(&mut state)
  }

  /// The node's own active annotation for `name`, if any.
  pub fn annotation(&self, name: &str) -> Option<Value> {
    self.with_state(|s| s.with.get(name).cloned())
  }

  pub fn set_annotation(&self, name: impl Into<String>, value: Value) {
    self.with_state(|s| {
      s.with.insert(name.into(), value);
    });
  }

  pub fn output(&self) -> Option<Value> {
    self.with_state(|s| s.output.clone())
  }

  pub fn set_output(&self, output: Value) {
    self.with_state(|s| s.output = Some(output));
  }
}
