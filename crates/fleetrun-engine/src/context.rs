//! Script contexts.
//!
//! A [`ScriptContext`] is one script instance running on one host: a
//! resolved command graph, a state scope, a session, and a cursor over the
//! graph. Within a context execution is sequential — one command active at a
//! time along the main chain — but resolution can arrive from any pool
//! thread, so the cursor is guarded by an activation epoch: whoever resolves
//! the current activation first wins, and stale resolutions are dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use fleetrun_cmd::{CmdGraph, CmdId, ResolvedScript};
use fleetrun_session::Session;
use fleetrun_state::State;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::exec;
use crate::run::RunCore;

struct Cursor {
  cmd: Option<CmdId>,
  epoch: u64,
}

pub struct ScriptContext {
  id: String,
  script: String,
  host: String,
  graph: RwLock<CmdGraph>,
  root: CmdId,
  state: Arc<State>,
  session: Arc<dyn Session>,
  core: Arc<RunCore>,
  /// Run generation this context belongs to; an abort or stage end bumps
  /// the run's generation, and stale contexts stop submitting.
  generation: u64,
  cursor: Mutex<Cursor>,
  /// Notified whenever the cursor moves; watcher feeds and timers use this
  /// to notice that their owner resolved.
  changed: Notify,
  timers: Mutex<Vec<JoinHandle<()>>>,
  finished: AtomicBool,
}

impl ScriptContext {
  pub(crate) fn new(
    core: Arc<RunCore>,
    resolved: ResolvedScript,
    session: Arc<dyn Session>,
  ) -> Arc<Self> {
    let host = session.host().to_string();
    let root_uid = resolved.graph.node(resolved.root).uid();
    let id = format!("{}:{}@{}", resolved.name, root_uid, host);
    let state = core
      .state()
      .child(host.clone())
      .child(format!("{}:{}", resolved.name, root_uid));
    let generation = core.generation();
    Arc::new(Self {
      id,
      script: resolved.name,
      host,
      root: resolved.root,
      graph: RwLock::new(resolved.graph),
      state,
      session,
      core,
      generation,
      cursor: Mutex::new(Cursor {
        cmd: Some(resolved.root),
        epoch: 0,
      }),
      changed: Notify::new(),
      timers: Mutex::new(Vec::new()),
      finished: AtomicBool::new(false),
    })
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn script(&self) -> &str {
    &self.script
  }

  pub fn host(&self) -> &str {
    &self.host
  }

  pub fn state(&self) -> &Arc<State> {
    &self.state
  }

  pub fn session(&self) -> &Arc<dyn Session> {
    &self.session
  }

  pub fn root(&self) -> CmdId {
    self.root
  }

  pub fn is_finished(&self) -> bool {
    self.finished.load(Ordering::SeqCst)
  }

  pub(crate) fn core(&self) -> &Arc<RunCore> {
    &self.core
  }

  pub(crate) fn graph(&self) -> RwLockReadGuard<'_, CmdGraph> {
    self.graph.read().expect("graph lock poisoned")
  }

  pub(crate) fn graph_mut(&self) -> RwLockWriteGuard<'_, CmdGraph> {
    self.graph.write().expect("graph lock poisoned")
  }

  pub(crate) fn changed_notify(&self) -> &Notify {
    &self.changed
  }

  /// Queue this context's current command on the command pool.
  pub fn activate(self: &Arc<Self>) {
    self.submit_current();
  }

  pub(crate) fn submit_current(self: &Arc<Self>) {
    if self.generation != self.core.generation() {
      debug!(context_id = %self.id, "context is from an ended stage, finishing");
      self.finish();
      return;
    }
    let ctx = self.clone();
    self
      .core
      .dispatcher()
      .submit(Box::pin(async move { exec::execute_activation(ctx).await }));
  }

  /// The command this context is currently executing, with its epoch.
  pub(crate) fn snapshot(&self) -> Option<(CmdId, u64)> {
    let cursor = self.cursor.lock().expect("cursor lock poisoned");
    cursor.cmd.map(|cmd| (cmd, cursor.epoch))
  }

  /// Whether `cmd` is still the active command of activation `epoch`.
  pub(crate) fn is_current(&self, cmd: CmdId, epoch: u64) -> bool {
    let cursor = self.cursor.lock().expect("cursor lock poisoned");
    cursor.cmd == Some(cmd) && cursor.epoch == epoch
  }

  /// Resolve the current activation "advance": record the output, move the
  /// cursor to the node's `next` link, and resubmit.
  pub(crate) fn advance(self: &Arc<Self>, epoch: u64, output: Value) {
    self.resolve(epoch, output, false);
  }

  /// Resolve the current activation "bypass": move to the `skip` link.
  pub(crate) fn bypass(self: &Arc<Self>, epoch: u64, output: Value) {
    self.resolve(epoch, output, true);
  }

  /// Drop the current activation without resolving it. The suspended
  /// command's completion (if any) becomes stale and the context finishes
  /// without ever entering the command's `next` link.
  pub(crate) fn abandon(self: &Arc<Self>, epoch: u64) {
    {
      let mut cursor = self.cursor.lock().expect("cursor lock poisoned");
      if cursor.epoch != epoch {
        trace!(context_id = %self.id, epoch, "stale abandon ignored");
        return;
      }
      let graph = self.graph();
      if let Some(cmd) = cursor.cmd {
        info!(
          context_id = %self.id,
          cmd = %graph.node(cmd).kind(),
          "abandoning active command"
        );
      }
      cursor.cmd = None;
      cursor.epoch += 1;
    }
    self.clear_timers();
    self.changed.notify_waiters();
    self.finish();
  }

  fn resolve(self: &Arc<Self>, epoch: u64, output: Value, use_skip: bool) {
    let link = {
      let mut cursor = self.cursor.lock().expect("cursor lock poisoned");
      if cursor.epoch != epoch {
        trace!(context_id = %self.id, epoch, "stale resolution dropped");
        return;
      }
      let Some(cmd) = cursor.cmd else {
        return;
      };
      let graph = self.graph();
      let node = graph.node(cmd);
      node.set_output(output.clone());
      if !node.kind().is_silent() {
        info!(
          context_id = %self.id,
          cmd = %node.kind(),
          bypass = use_skip,
          "command resolved"
        );
      }
      let link = if use_skip { graph.skip(cmd) } else { graph.next(cmd) };
      cursor.cmd = link;
      cursor.epoch += 1;
      link
    };
    self.clear_timers();
    self.changed.notify_waiters();
    match link {
      Some(_) => self.submit_current(),
      None => self.finish(),
    }
  }

  pub(crate) fn add_timer_handle(&self, handle: JoinHandle<()>) {
    self.timers.lock().expect("timer lock poisoned").push(handle);
  }

  fn clear_timers(&self) {
    let mut timers = self.timers.lock().expect("timer lock poisoned");
    for timer in timers.drain(..) {
      timer.abort();
    }
  }

  pub(crate) fn finish(self: &Arc<Self>) {
    if !self.finished.swap(true, Ordering::SeqCst) {
      debug!(context_id = %self.id, "context finished");
      self.clear_timers();
      self.changed.notify_waiters();
      self.core.context_finished(self.generation);
    }
  }
}
