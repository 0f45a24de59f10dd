//! Command kinds.
//!
//! The set of behaviors is closed: execution is a single match over
//! [`CmdKind`], which keeps the resolve-exactly-once contract visible in one
//! place instead of scattered across trait impls.

use std::fmt;
use std::sync::Arc;

use fleetrun_state::State;
use serde_json::Value;

/// Outcome of a [`CmdKind::Code`] closure.
#[derive(Debug)]
pub enum CodeResult {
  /// Advance to the node's `next` link with this output.
  Next(Value),
  /// Bypass to the node's `skip` link with this output.
  Skip(Value),
  /// Abort the whole run.
  Abort(String),
}

/// User-supplied behavior, used for computed steps and heavily by tests.
pub type CodeFn = dyn Fn(Value, &State) -> CodeResult + Send + Sync;

/// The behavior of one command node.
#[derive(Clone)]
pub enum CmdKind {
  /// Pass-through; advances with its input.
  NoOp { name: String },
  /// Marks the owning context finished without touching the rest of the run.
  Done,
  /// Aborts the whole run.
  Abort { message: String, skip_cleanup: bool },
  /// Logs a populated message to the run log.
  Log { message: String },
  /// Echoes its input to the run log.
  Echo,
  /// Runs a shell command on the bound session.
  Sh { command: String, silent: bool },
  /// Writes a value (or the piped input) into the variable store.
  SetState { key: String, value: Option<String> },
  /// Reads a value; advances with it, or bypasses when missing.
  ReadState { key: String },
  /// Matches the input against a pattern, capturing named groups into state.
  /// `miss` inverts the match: advance when the pattern does NOT match.
  Regex { pattern: String, miss: bool },
  /// Defers the continuation by a parsed duration (`500`, `2s`, `1m`, …).
  Sleep { amount: String },
  /// Declares a signal latch with an initial count.
  SetSignal { name: String, initial: String, forced: bool },
  /// Decrements a signal latch.
  Signal { name: String },
  /// Suspends until a signal latch reaches zero.
  WaitFor { name: String, initial: Option<String> },
  /// Gate that opens after `initial` passes through it.
  Countdown { name: String, initial: i64 },
  /// Loop controller: one activation per element of its input sequence.
  ForEach { name: String, input: Option<String> },
  /// Loop controller: repeats its body while the named latch is above zero.
  RepeatUntilSignal { name: String },
  /// Hidden tail of a loop body; its `next` is spliced back to the
  /// controller at instantiation.
  LoopCallback,
  /// Resolves a named script and grafts a fresh copy in as its subtree.
  ScriptCmd { name: String },
  /// Interrupts the in-flight command of the owning context's session,
  /// abandoning (not advancing) the suspended parent node.
  CtrlC,
  /// User closure.
  Code { code: Arc<CodeFn> },
}

impl CmdKind {
  /// Commands that never log their output (declaration/bookkeeping steps).
  pub fn is_silent(&self) -> bool {
    matches!(
      self,
      CmdKind::Sleep { .. }
        | CmdKind::SetSignal { .. }
        | CmdKind::WaitFor { .. }
        | CmdKind::Log { .. }
        | CmdKind::LoopCallback
        | CmdKind::Sh { silent: true, .. }
    )
  }
}

impl fmt::Display for CmdKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CmdKind::NoOp { name } => write!(f, "{}", name),
      CmdKind::Done => write!(f, "done"),
      CmdKind::Abort { message, .. } => write!(f, "abort: {}", message),
      CmdKind::Log { message } => write!(f, "log: {}", message),
      CmdKind::Echo => write!(f, "echo"),
      CmdKind::Sh { command, .. } => write!(f, "sh: {}", command),
      CmdKind::SetState { key, value } => match value {
        Some(value) => write!(f, "set-state: {} {}", key, value),
        None => write!(f, "set-state: {}", key),
      },
      CmdKind::ReadState { key } => write!(f, "read-state: {}", key),
      CmdKind::Regex { pattern, miss } => {
        write!(f, "regex: {}{}", if *miss { "!" } else { "" }, pattern)
      }
      CmdKind::Sleep { amount } => write!(f, "sleep: {}", amount),
      CmdKind::SetSignal { name, initial, .. } => write!(f, "set-signal: {} {}", name, initial),
      CmdKind::Signal { name } => write!(f, "signal: {}", name),
      CmdKind::WaitFor { name, .. } => write!(f, "wait-for: {}", name),
      CmdKind::Countdown { name, initial } => write!(f, "countdown: {} {}", name, initial),
      CmdKind::ForEach { name, input } => match input {
        Some(input) => write!(f, "for-each: {} {}", name, input),
        None => write!(f, "for-each: {}", name),
      },
      CmdKind::RepeatUntilSignal { name } => write!(f, "repeat-until: {}", name),
      CmdKind::LoopCallback => write!(f, "loop-callback"),
      CmdKind::ScriptCmd { name } => write!(f, "script: {}", name),
      CmdKind::CtrlC => write!(f, "ctrl-c"),
      CmdKind::Code { .. } => write!(f, "code"),
    }
  }
}

impl fmt::Debug for CmdKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self)
  }
}
