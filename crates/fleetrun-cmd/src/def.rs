//! Command templates.
//!
//! A [`CmdDef`] is one authored step plus its then-chain, watchers, and
//! timers. Defs are immutable once a script is built; every execution works
//! on a fresh arena instance, never on the template.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::kind::{CmdKind, CodeFn, CodeResult};

/// One authored command and its sub-graphs.
#[derive(Debug, Clone)]
pub struct CmdDef {
  pub(crate) kind: CmdKind,
  pub(crate) with: BTreeMap<String, Value>,
  pub(crate) thens: Vec<CmdDef>,
  pub(crate) watchers: Vec<CmdDef>,
  pub(crate) timers: Vec<(Duration, CmdDef)>,
}

impl CmdDef {
  pub fn new(kind: CmdKind) -> Self {
    Self {
      kind,
      with: BTreeMap::new(),
      thens: Vec::new(),
      watchers: Vec::new(),
      timers: Vec::new(),
    }
  }

  pub fn no_op() -> Self {
    Self::new(CmdKind::NoOp {
      name: "no-op".to_string(),
    })
  }

  pub fn done() -> Self {
    Self::new(CmdKind::Done)
  }

  pub fn abort(message: impl Into<String>) -> Self {
    Self::new(CmdKind::Abort {
      message: message.into(),
      skip_cleanup: false,
    })
  }

  pub fn abort_skip_cleanup(message: impl Into<String>) -> Self {
    Self::new(CmdKind::Abort {
      message: message.into(),
      skip_cleanup: true,
    })
  }

  pub fn log(message: impl Into<String>) -> Self {
    Self::new(CmdKind::Log {
      message: message.into(),
    })
  }

  pub fn echo() -> Self {
    Self::new(CmdKind::Echo)
  }

  pub fn sh(command: impl Into<String>) -> Self {
    Self::new(CmdKind::Sh {
      command: command.into(),
      silent: false,
    })
  }

  pub fn sh_silent(command: impl Into<String>) -> Self {
    Self::new(CmdKind::Sh {
      command: command.into(),
      silent: true,
    })
  }

  pub fn set_state(key: impl Into<String>, value: impl Into<String>) -> Self {
    Self::new(CmdKind::SetState {
      key: key.into(),
      value: Some(value.into()),
    })
  }

  /// `set-state` with no value stores the piped input.
  pub fn set_state_from_input(key: impl Into<String>) -> Self {
    Self::new(CmdKind::SetState {
      key: key.into(),
      value: None,
    })
  }

  pub fn read_state(key: impl Into<String>) -> Self {
    Self::new(CmdKind::ReadState { key: key.into() })
  }

  pub fn regex(pattern: impl Into<String>) -> Self {
    Self::new(CmdKind::Regex {
      pattern: pattern.into(),
      miss: false,
    })
  }

  pub fn regex_miss(pattern: impl Into<String>) -> Self {
    Self::new(CmdKind::Regex {
      pattern: pattern.into(),
      miss: true,
    })
  }

  pub fn sleep(amount: impl Into<String>) -> Self {
    Self::new(CmdKind::Sleep {
      amount: amount.into(),
    })
  }

  pub fn set_signal(name: impl Into<String>, initial: impl Into<String>) -> Self {
    Self::new(CmdKind::SetSignal {
      name: name.into(),
      initial: initial.into(),
      forced: false,
    })
  }

  pub fn set_signal_forced(name: impl Into<String>, initial: impl Into<String>) -> Self {
    Self::new(CmdKind::SetSignal {
      name: name.into(),
      initial: initial.into(),
      forced: true,
    })
  }

  pub fn signal(name: impl Into<String>) -> Self {
    Self::new(CmdKind::Signal { name: name.into() })
  }

  pub fn wait_for(name: impl Into<String>) -> Self {
    Self::new(CmdKind::WaitFor {
      name: name.into(),
      initial: None,
    })
  }

  /// `wait-for` that also declares the latch when it is first to arrive.
  pub fn wait_for_with_initial(name: impl Into<String>, initial: impl Into<String>) -> Self {
    Self::new(CmdKind::WaitFor {
      name: name.into(),
      initial: Some(initial.into()),
    })
  }

  pub fn countdown(name: impl Into<String>, initial: i64) -> Self {
    Self::new(CmdKind::Countdown {
      name: name.into(),
      initial,
    })
  }

  pub fn for_each(name: impl Into<String>) -> Self {
    Self::new(CmdKind::ForEach {
      name: name.into(),
      input: None,
    })
  }

  pub fn for_each_over(name: impl Into<String>, input: impl Into<String>) -> Self {
    Self::new(CmdKind::ForEach {
      name: name.into(),
      input: Some(input.into()),
    })
  }

  pub fn repeat_until(name: impl Into<String>) -> Self {
    Self::new(CmdKind::RepeatUntilSignal { name: name.into() })
  }

  pub fn script(name: impl Into<String>) -> Self {
    Self::new(CmdKind::ScriptCmd { name: name.into() })
  }

  pub fn ctrl_c() -> Self {
    Self::new(CmdKind::CtrlC)
  }

  pub fn code<F>(f: F) -> Self
  where
    F: Fn(Value, &fleetrun_state::State) -> CodeResult + Send + Sync + 'static,
  {
    Self::new(CmdKind::Code { code: Arc::new(f) })
  }

  /// Append `child` to this node's then-chain.
  pub fn then(mut self, child: CmdDef) -> Self {
    self.thens.push(child);
    self
  }

  /// Attach a watcher sub-graph; it runs concurrently against this node's
  /// output lines.
  pub fn watch(mut self, watcher: CmdDef) -> Self {
    self.watchers.push(watcher);
    self
  }

  /// Attach a timer sub-graph; it runs as an independent branch if this node
  /// has not resolved within `timeout`.
  pub fn add_timer(mut self, timeout: Duration, timer: CmdDef) -> Self {
    self.timers.push((timeout, timer));
    self
  }

  /// Set an annotation default visible to this node and its sub-graphs.
  pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
    self.with.insert(key.into(), value);
    self
  }

  pub fn kind(&self) -> &CmdKind {
    &self.kind
  }

  pub fn code_fn(f: Arc<CodeFn>) -> Self {
    Self::new(CmdKind::Code { code: f })
  }
}
