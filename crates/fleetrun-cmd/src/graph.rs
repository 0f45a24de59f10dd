//! Arena-backed instance graphs.
//!
//! Nodes are addressed by index, so loop splices (`next` pointing back at a
//! controller) are plain data. The arena is append-only: grafting a script
//! copy at run time never invalidates existing ids.

use std::collections::BTreeMap;

use crate::def::CmdDef;
use crate::kind::CmdKind;
use crate::node::{Cmd, NodeState, next_uid};

/// Index of a node within one [`CmdGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CmdId(pub(crate) u32);

/// One resolved instance graph.
#[derive(Debug, Default)]
pub struct CmdGraph {
  nodes: Vec<Cmd>,
}

impl CmdGraph {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn node(&self, id: CmdId) -> &Cmd {
    &self.nodes[id.0 as usize]
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  pub fn ids(&self) -> impl Iterator<Item = CmdId> + '_ {
    (0..self.nodes.len() as u32).map(CmdId)
  }

  /// The link entered when a node resolves "advance": loop override, first
  /// then-child, or the sibling that follows this node's subtree.
  pub fn next(&self, id: CmdId) -> Option<CmdId> {
    let node = self.node(id);
    if let Some(forced) = node.next_override {
      return Some(forced);
    }
    if let Some(first) = node.thens.first() {
      return Some(*first);
    }
    self.following_sibling(id)
  }

  /// The link entered when a node resolves "bypass": the node that follows
  /// this node's entire subtree in authored order.
  pub fn skip(&self, id: CmdId) -> Option<CmdId> {
    self.following_sibling(id)
  }

  /// The node whose recorded output feeds this node's activation: the
  /// preceding sibling, or the parent for a first child. Loop controllers
  /// re-enter with their original input because their preceding sibling is
  /// outside the loop body.
  pub fn previous(&self, id: CmdId) -> Option<CmdId> {
    let parent = self.node(id).parent?;
    let siblings = &self.node(parent).thens;
    let idx = siblings.iter().position(|c| *c == id)?;
    if idx > 0 {
      Some(siblings[idx - 1])
    } else {
      Some(parent)
    }
  }

  fn following_sibling(&self, id: CmdId) -> Option<CmdId> {
    let mut target = id;
    while let Some(parent) = self.node(target).parent {
      let siblings = &self.node(parent).thens;
      let idx = siblings.iter().position(|c| *c == target)?;
      if idx + 1 < siblings.len() {
        return Some(siblings[idx + 1]);
      }
      target = parent;
    }
    None
  }

  /// Annotation lookup along the annotation-parent chain, innermost first.
  pub fn visible_annotation(&self, id: CmdId, name: &str) -> Option<serde_json::Value> {
    let mut target = Some(id);
    while let Some(current) = target {
      let node = self.node(current);
      if let Some(value) = node.annotation(name) {
        return Some(value);
      }
      target = node.state_parent;
    }
    None
  }

  /// Instantiate a template subtree into this graph with fresh uids.
  ///
  /// Loop controllers get a hidden [`CmdKind::LoopCallback`] appended as the
  /// final then-child, with `next` spliced back to the controller; the
  /// controller's own `skip` still resolves to whatever followed the loop.
  pub fn instantiate(
    &mut self,
    def: &CmdDef,
    parent: Option<CmdId>,
    state_parent: Option<CmdId>,
  ) -> CmdId {
    let id = self.push(def.kind.clone(), parent, state_parent, &def.with);
    for child in &def.thens {
      let child_id = self.instantiate(child, Some(id), Some(id));
      self.nodes[id.0 as usize].thens.push(child_id);
    }
    if matches!(
      def.kind,
      CmdKind::ForEach { .. } | CmdKind::RepeatUntilSignal { .. }
    ) {
      let callback = self.push(CmdKind::LoopCallback, Some(id), Some(id), &BTreeMap::new());
      self.nodes[callback.0 as usize].next_override = Some(id);
      self.nodes[id.0 as usize].thens.push(callback);
    }
    for watcher in &def.watchers {
      let watcher_id = self.instantiate(watcher, None, Some(id));
      self.nodes[id.0 as usize].watchers.push(watcher_id);
    }
    for (timeout, timer) in &def.timers {
      let timer_id = self.instantiate(timer, None, Some(id));
      self.nodes[id.0 as usize].timers.push((*timeout, timer_id));
    }
    id
  }

  /// Graft a template subtree in as `owner`'s first then-child, so `owner`'s
  /// `next` enters the graft and the graft's tail continues after `owner`.
  pub fn graft_first(&mut self, def: &CmdDef, owner: CmdId) -> CmdId {
    let grafted = self.instantiate(def, Some(owner), Some(owner));
    self.nodes[owner.0 as usize].thens.insert(0, grafted);
    grafted
  }

  fn push(
    &mut self,
    kind: CmdKind,
    parent: Option<CmdId>,
    state_parent: Option<CmdId>,
    with: &BTreeMap<String, serde_json::Value>,
  ) -> CmdId {
    let id = CmdId(self.nodes.len() as u32);
    self.nodes.push(Cmd {
      uid: next_uid(),
      kind,
      parent,
      state_parent,
      thens: Vec::new(),
      watchers: Vec::new(),
      timers: Vec::new(),
      next_override: None,
      state: std::sync::Mutex::new(NodeState {
        with: with.clone(),
        ..NodeState::default()
      }),
    });
    id
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::def::CmdDef;

  #[test]
  fn next_prefers_then_chain() {
    let mut graph = CmdGraph::new();
    let root = graph.instantiate(
      &CmdDef::no_op().then(CmdDef::log("a")).then(CmdDef::log("b")),
      None,
      None,
    );
    let a = graph.node(root).thens()[0];
    let b = graph.node(root).thens()[1];
    assert_eq!(graph.next(root), Some(a));
    assert_eq!(graph.next(a), Some(b));
    assert_eq!(graph.next(b), None);
  }

  #[test]
  fn skip_jumps_past_subtree() {
    // a(then: a1, a2) then b — skipping `a` must land on b, not a1
    let mut graph = CmdGraph::new();
    let root = graph.instantiate(
      &CmdDef::no_op()
        .then(
          CmdDef::log("a")
            .then(CmdDef::log("a1"))
            .then(CmdDef::log("a2")),
        )
        .then(CmdDef::log("b")),
      None,
      None,
    );
    let a = graph.node(root).thens()[0];
    let b = graph.node(root).thens()[1];
    let a2 = graph.node(a).thens()[1];
    assert_eq!(graph.skip(a), Some(b));
    // the last node of a subtree advances to the node after the subtree
    assert_eq!(graph.next(a2), Some(b));
  }

  #[test]
  fn loop_callback_cycles_to_controller() {
    let mut graph = CmdGraph::new();
    let root = graph.instantiate(
      &CmdDef::no_op()
        .then(CmdDef::for_each("it").then(CmdDef::log("body")))
        .then(CmdDef::log("after")),
      None,
      None,
    );
    let controller = graph.node(root).thens()[0];
    let after = graph.node(root).thens()[1];
    let body = graph.node(controller).thens()[0];
    let callback = *graph.node(controller).thens().last().unwrap();

    assert!(matches!(graph.node(callback).kind(), CmdKind::LoopCallback));
    // body tail flows into the callback, which cycles back to the controller
    assert_eq!(graph.next(body), Some(callback));
    assert_eq!(graph.next(callback), Some(controller));
    // the controller's exit continuation is the node that followed the loop
    assert_eq!(graph.skip(controller), Some(after));
  }

  #[test]
  fn watcher_branches_terminate() {
    let mut graph = CmdGraph::new();
    let root = graph.instantiate(
      &CmdDef::no_op()
        .then(CmdDef::sh("tail -f log").watch(CmdDef::regex("ERROR").then(CmdDef::ctrl_c())))
        .then(CmdDef::log("after")),
      None,
      None,
    );
    let sh = graph.node(root).thens()[0];
    let watcher = graph.node(sh).watchers()[0];
    let ctrl_c = graph.node(watcher).thens()[0];
    // a watcher chain ends instead of leaking into the owner's then-chain
    assert_eq!(graph.next(ctrl_c), None);
    assert_eq!(graph.skip(watcher), None);
    // but annotations on the owner stay visible inside the watcher
    graph.node(sh).set_annotation("attempt", serde_json::json!(2));
    assert_eq!(
      graph.visible_annotation(ctrl_c, "attempt"),
      Some(serde_json::json!(2))
    );
  }
}
