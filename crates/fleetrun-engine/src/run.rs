//! Run lifecycle.
//!
//! A [`Run`] owns everything shared by the contexts of one orchestration
//! run: the script registry, the signal coordinator, the dispatcher, the
//! root state scope, and the stage progression. Stage boundaries and
//! latch-reached notifications are published as [`RunEvent`]s for whatever
//! pipeline drives the run.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use fleetrun_cmd::{ResolvedScript, Script};
use fleetrun_coordinator::Coordinator;
use fleetrun_session::Session;
use fleetrun_state::State;
use tokio::sync::{Notify, broadcast};
use tracing::{error, info, warn};

use crate::context::ScriptContext;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::error::EngineError;

/// Lifecycle stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
  Pending,
  Setup,
  Run,
  Cleanup,
  Done,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Stage::Pending => "pending",
      Stage::Setup => "setup",
      Stage::Run => "run",
      Stage::Cleanup => "cleanup",
      Stage::Done => "done",
    };
    write!(f, "{}", name)
  }
}

/// Notifications published while a run executes.
#[derive(Debug, Clone)]
pub enum RunEvent {
  StageStart(Stage),
  StageEnd(Stage),
  /// A signal latch reached zero.
  SignalReached(String),
  Aborted { skip_cleanup: bool },
}

pub(crate) struct RunCore {
  id: String,
  scripts: RwLock<BTreeMap<String, Script>>,
  coordinator: Arc<Coordinator>,
  dispatcher: Arc<Dispatcher>,
  state: Arc<State>,
  /// Sessions bound to contexts of this run, interrupted best-effort on
  /// abort.
  sessions: Mutex<Vec<Arc<dyn Session>>>,
  stage: Mutex<Stage>,
  /// Bumped on abort and on stage end; contexts from older generations stop
  /// submitting activations.
  generation: AtomicU64,
  aborted: AtomicBool,
  skip_cleanup: AtomicBool,
  /// Contexts still running in the current stage.
  active: AtomicUsize,
  stage_notify: Notify,
  events: broadcast::Sender<RunEvent>,
}

impl RunCore {
  pub(crate) fn state(&self) -> &Arc<State> {
    &self.state
  }

  pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
    &self.dispatcher
  }

  pub(crate) fn coordinator(&self) -> &Arc<Coordinator> {
    &self.coordinator
  }

  pub(crate) fn generation(&self) -> u64 {
    self.generation.load(Ordering::SeqCst)
  }

  pub(crate) fn script(&self, name: &str) -> Option<Script> {
    self.scripts.read().expect("script lock poisoned").get(name).cloned()
  }

  /// A context finished. Contexts from an ended generation are ignored so a
  /// straggler resolving late cannot eat into the next stage's count.
  pub(crate) fn context_finished(&self, generation: u64) {
    if generation != self.generation() {
      return;
    }
    let previous = self
      .active
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    if previous == Ok(1) {
      self.stage_notify.notify_waiters();
    }
  }

  /// Run-wide abort: drop pending waiters so nothing stuck on a cross-host
  /// wait can block termination, invalidate outstanding activations, and
  /// interrupt in-flight session commands best-effort.
  pub(crate) fn abort(&self, skip_cleanup: bool) {
    if !self.aborted.swap(true, Ordering::SeqCst) {
      error!(run_id = %self.id, skip_cleanup, "run aborted");
      self.skip_cleanup.store(skip_cleanup, Ordering::SeqCst);
      self.coordinator.clear_waiters();
      self.generation.fetch_add(1, Ordering::SeqCst);
      for session in self.sessions.lock().expect("session lock poisoned").iter() {
        session.request_cancel();
      }
      self.send(RunEvent::Aborted { skip_cleanup });
      self.stage_notify.notify_waiters();
    }
  }

  /// End the current stage early (the `done` command).
  pub(crate) fn request_done(&self) {
    self.coordinator.clear_waiters();
    self.generation.fetch_add(1, Ordering::SeqCst);
    self.stage_notify.notify_waiters();
  }

  pub(crate) fn is_aborted(&self) -> bool {
    self.aborted.load(Ordering::SeqCst)
  }

  fn send(&self, event: RunEvent) {
    let _ = self.events.send(event);
  }
}

/// One orchestration run.
pub struct Run {
  core: Arc<RunCore>,
}

impl Run {
  pub fn new() -> Self {
    Self::with_config(DispatcherConfig::default())
  }

  pub fn with_config(config: DispatcherConfig) -> Self {
    let (events, _) = broadcast::channel(256);
    let coordinator = Arc::new(Coordinator::new());
    let signal_events = events.clone();
    coordinator.add_observer(move |name| {
      let _ = signal_events.send(RunEvent::SignalReached(name.to_string()));
    });
    let core = Arc::new(RunCore {
      id: uuid::Uuid::new_v4().to_string(),
      scripts: RwLock::new(BTreeMap::new()),
      coordinator,
      dispatcher: Arc::new(Dispatcher::new(config)),
      state: State::root(),
      sessions: Mutex::new(Vec::new()),
      stage: Mutex::new(Stage::Pending),
      generation: AtomicU64::new(0),
      aborted: AtomicBool::new(false),
      skip_cleanup: AtomicBool::new(false),
      active: AtomicUsize::new(0),
      stage_notify: Notify::new(),
      events,
    });
    Self { core }
  }

  pub fn id(&self) -> String {
    self.core.id.clone()
  }

  /// Register a script template. Replacing an existing name is allowed but
  /// flagged, since it usually means two roles collided on a name.
  pub fn add_script(&self, script: Script) {
    let mut scripts = self.core.scripts.write().expect("script lock poisoned");
    if scripts.insert(script.name().to_string(), script.clone()).is_some() {
      warn!(run_id = %self.core.id, script = %script.name(), "replacing existing script");
    }
  }

  /// Resolve a named script into a fresh instance graph. An unknown name is
  /// a configuration error: the run is refused, not degraded.
  pub fn resolve_script(&self, name: &str) -> Result<ResolvedScript, EngineError> {
    match self.core.script(name) {
      Some(script) => Ok(script.resolve()),
      None => Err(EngineError::UnknownScript {
        name: name.to_string(),
      }),
    }
  }

  /// Bind one resolved script instance to one session.
  pub fn new_context(
    &self,
    script: &str,
    session: Arc<dyn Session>,
  ) -> Result<Arc<ScriptContext>, EngineError> {
    let resolved = self.resolve_script(script)?;
    self
      .core
      .sessions
      .lock()
      .expect("session lock poisoned")
      .push(session.clone());
    Ok(ScriptContext::new(self.core.clone(), resolved, session))
  }

  /// Open every context's session in parallel and reduce with logical AND:
  /// one failure fails the phase and aborts the run — there is no quorum or
  /// degraded-mode continuation.
  pub async fn connect_all(&self, contexts: &[Arc<ScriptContext>]) -> Result<(), EngineError> {
    let attempts = contexts.iter().map(|ctx| {
      let session = ctx.session().clone();
      let host = ctx.host().to_string();
      async move {
        session
          .open()
          .await
          .map_err(|source| EngineError::Connect { host, source })
      }
    });
    let mut first_failure = None;
    for result in futures::future::join_all(attempts).await {
      if let Err(e) = result {
        error!(run_id = %self.core.id, error = %e, "connect failed");
        if first_failure.is_none() {
          first_failure = Some(e);
        }
      }
    }
    match first_failure {
      None => Ok(()),
      Some(e) => {
        self.abort(false);
        Err(e)
      }
    }
  }

  /// Activate `contexts` for `stage` and wait until every context finishes,
  /// a `done` command ends the stage, or the run aborts. Aborting leaves
  /// the cleanup stage reachable: blocked contexts are invalidated instead
  /// of waited for.
  pub async fn run_stage(
    &self,
    stage: Stage,
    contexts: Vec<Arc<ScriptContext>>,
  ) -> Result<(), EngineError> {
    let aborted_at_entry = self.core.is_aborted();
    *self.core.stage.lock().expect("stage lock poisoned") = stage;
    self.core.send(RunEvent::StageStart(stage));
    info!(run_id = %self.core.id, stage = %stage, contexts = contexts.len(), "stage started");

    if !contexts.is_empty() {
      let stage_generation = self.core.generation();
      self.core.active.store(contexts.len(), Ordering::SeqCst);
      for ctx in &contexts {
        ctx.activate();
      }
      loop {
        let notified = self.core.stage_notify.notified();
        tokio::pin!(notified);
        // register before checking, or a wakeup firing in between is lost
        notified.as_mut().enable();
        if self.core.active.load(Ordering::SeqCst) == 0 {
          break;
        }
        if self.core.generation() != stage_generation {
          break;
        }
        notified.await;
      }
    }

    self.core.send(RunEvent::StageEnd(stage));
    info!(run_id = %self.core.id, stage = %stage, "stage ended");
    // a cleanup stage running after an abort completes normally; only a
    // stage the abort cut short reports it
    if self.core.is_aborted() && !aborted_at_entry {
      Err(EngineError::Aborted)
    } else {
      Ok(())
    }
  }

  pub fn abort(&self, skip_cleanup: bool) {
    self.core.abort(skip_cleanup);
  }

  pub fn is_aborted(&self) -> bool {
    self.core.is_aborted()
  }

  /// Whether the cleanup stage should still run. An abort skips cleanup
  /// only when explicitly asked to.
  pub fn should_run_cleanup(&self) -> bool {
    !(self.core.is_aborted() && self.core.skip_cleanup.load(Ordering::SeqCst))
  }

  pub fn stage(&self) -> Stage {
    *self.core.stage.lock().expect("stage lock poisoned")
  }

  pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
    self.core.events.subscribe()
  }

  pub fn coordinator(&self) -> &Arc<Coordinator> {
    &self.core.coordinator
  }

  pub fn state(&self) -> &Arc<State> {
    &self.core.state
  }

  /// Stop the worker pools. The run is unusable afterwards.
  pub fn shutdown(&self) {
    self.core.dispatcher.stop();
  }
}

impl Default for Run {
  fn default() -> Self {
    Self::new()
  }
}
