//! Per-kind command execution.
//!
//! One dispatch function over [`CmdKind`]; every arm resolves exactly one of
//! advance, bypass, or abort — or registers a continuation and returns
//! [`Resolved::Pending`], leaving the actual resolution to whichever pool
//! thread satisfies the condition (a latch reaching zero, a timer firing, or
//! a session completion).

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use fleetrun_cmd::{CmdId, CmdKind, CodeResult};
use fleetrun_coordinator::Waiter;
use fleetrun_state::{PatternError, convert_type, has_placeholder, render};
use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::context::ScriptContext;
use crate::error::EngineError;

/// How one activation of a command resolved.
pub(crate) enum Resolved {
  /// Enter the node's `next` link with this output.
  Next(Value),
  /// Enter the node's `skip` link with this output.
  Skip(Value),
  /// Unwind the whole run.
  Abort { skip_cleanup: bool },
  /// A continuation was registered; resolution happens later.
  Pending,
}

/// Where a node is being executed.
#[derive(Clone, Copy)]
pub(crate) enum ExecMode {
  /// The context's main chain; suspension re-enters through the cursor.
  Activation { epoch: u64 },
  /// A watcher or timer branch, driven inline. `owner` identifies the
  /// activation the branch is attached to, for interrupt guards.
  Branch { owner: Option<(CmdId, u64)> },
}

/// Execute the context's current command, resolving the cursor when the
/// command completes synchronously.
pub(crate) async fn execute_activation(ctx: Arc<ScriptContext>) {
  let Some((cmd, epoch)) = ctx.snapshot() else {
    ctx.finish();
    return;
  };

  // input is the recorded output of the node that precedes this one in
  // authored order, which keeps loop controllers re-entering with their
  // original input rather than their body's last output
  let (input, has_watchers) = {
    let graph = ctx.graph();
    let input = graph
      .previous(cmd)
      .and_then(|prev| graph.node(prev).output())
      .unwrap_or_else(|| json!(""));
    (input, graph.node(cmd).has_watchers())
  };

  start_timers(&ctx, cmd, epoch);
  if has_watchers {
    // subscribe before the command starts so no early line is missed
    let rx = ctx.session().subscribe_lines();
    let feed = ctx.clone();
    ctx
      .core()
      .dispatcher()
      .submit_callback(Box::pin(async move { watcher_feed(feed, cmd, epoch, rx).await }));
  }

  match run_node(&ctx, cmd, input, ExecMode::Activation { epoch }).await {
    Resolved::Next(v) => ctx.advance(epoch, v),
    Resolved::Skip(v) => ctx.bypass(epoch, v),
    Resolved::Abort { skip_cleanup } => ctx.core().abort(skip_cleanup),
    Resolved::Pending => {}
  }
}

/// Drive a watcher or timer subtree inline, following `next`/`skip` links
/// until the branch ends. A branch that suspends is abandoned.
pub(crate) async fn run_branch(
  ctx: Arc<ScriptContext>,
  root: CmdId,
  input: Value,
  owner: Option<(CmdId, u64)>,
) {
  let mut current = Some(root);
  let mut value = input;
  while let Some(id) = current {
    let outcome = run_node(&ctx, id, value.clone(), ExecMode::Branch { owner }).await;
    let step = {
      let graph = ctx.graph();
      match outcome {
        Resolved::Next(v) => {
          graph.node(id).set_output(v.clone());
          Some((graph.next(id), v))
        }
        Resolved::Skip(v) => {
          graph.node(id).set_output(v.clone());
          Some((graph.skip(id), v))
        }
        Resolved::Abort { skip_cleanup } => {
          drop(graph);
          ctx.core().abort(skip_cleanup);
          None
        }
        Resolved::Pending => {
          warn!(
            context_id = %ctx.id(),
            cmd = %graph.node(id).kind(),
            "branch command suspended, abandoning branch"
          );
          None
        }
      }
    };
    match step {
      Some((link, v)) => {
        current = link;
        value = v;
      }
      None => return,
    }
  }
}

/// Publish each session line to every watcher of `cmd` until the owning
/// activation resolves or the line stream closes.
async fn watcher_feed(
  ctx: Arc<ScriptContext>,
  cmd: CmdId,
  epoch: u64,
  mut rx: tokio::sync::broadcast::Receiver<String>,
) {
  loop {
    if !ctx.is_current(cmd, epoch) {
      break;
    }
    tokio::select! {
      line = rx.recv() => match line {
        Ok(line) => {
          if !ctx.is_current(cmd, epoch) {
            break;
          }
          let watchers = ctx.graph().node(cmd).watchers().to_vec();
          for watcher in watchers {
            run_branch(ctx.clone(), watcher, json!(line.clone()), Some((cmd, epoch))).await;
          }
        }
        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
          warn!(context_id = %ctx.id(), missed, "watcher feed lagged, lines dropped");
        }
        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
      },
      _ = ctx.changed_notify().notified() => {}
    }
  }
}

fn start_timers(ctx: &Arc<ScriptContext>, cmd: CmdId, epoch: u64) {
  let timers = ctx.graph().node(cmd).timers().to_vec();
  for (timeout, timer_root) in timers {
    let branch_ctx = ctx.clone();
    let handle = ctx.core().dispatcher().schedule(
      timeout,
      Box::pin(async move {
        // the owner may have resolved while the fire was queued
        if branch_ctx.is_current(cmd, epoch) {
          debug!(context_id = %branch_ctx.id(), timeout_ms = timeout.as_millis() as u64, "timer fired");
          let input = json!(timeout.as_millis() as u64);
          run_branch(branch_ctx, timer_root, input, Some((cmd, epoch))).await;
        }
      }),
    );
    ctx.add_timer_handle(handle);
  }
}

/// Populate placeholders from the node's visible annotations and the
/// context's state chain.
fn populate_for(ctx: &ScriptContext, id: CmdId, text: &str) -> Result<String, PatternError> {
  let graph = ctx.graph();
  fleetrun_state::populate(text, ctx.state().as_ref(), |name| {
    graph.visible_annotation(id, name)
  })
}

/// Populate, falling back to the partially substituted text on a miss.
/// Missing names are a soft condition for most commands.
fn populate_lenient(ctx: &ScriptContext, id: CmdId, text: &str) -> String {
  populate_for(ctx, id, text).unwrap_or_else(|e| e.result)
}

pub(crate) async fn run_node(
  ctx: &Arc<ScriptContext>,
  id: CmdId,
  input: Value,
  mode: ExecMode,
) -> Resolved {
  let kind = ctx.graph().node(id).kind().clone();
  match kind {
    CmdKind::NoOp { .. } | CmdKind::LoopCallback => Resolved::Next(input),

    CmdKind::Done => {
      info!(context_id = %ctx.id(), "done requested, ending stage");
      ctx.core().request_done();
      Resolved::Next(input)
    }

    CmdKind::Abort {
      message,
      skip_cleanup,
    } => {
      let message = populate_lenient(ctx, id, &message);
      error!(context_id = %ctx.id(), message = %message, "abort requested");
      Resolved::Abort { skip_cleanup }
    }

    CmdKind::Log { message } => {
      let message = populate_lenient(ctx, id, &message);
      info!(context_id = %ctx.id(), "{}", message);
      Resolved::Next(input)
    }

    CmdKind::Echo => {
      info!(context_id = %ctx.id(), "{}", render(&input));
      Resolved::Next(input)
    }

    CmdKind::Sh { command, .. } => run_sh(ctx, id, &command, input, mode).await,

    CmdKind::SetState { key, value } => {
      let key = populate_lenient(ctx, id, &key);
      let stored = match value {
        Some(value) => convert_type(&populate_lenient(ctx, id, &value)),
        None => Value::from(render(&input).trim().to_string()),
      };
      ctx.state().set(&key, stored);
      Resolved::Next(input)
    }

    CmdKind::ReadState { key } => {
      let key = populate_lenient(ctx, id, &key);
      match ctx.state().get(&key) {
        Some(value) => Resolved::Next(value),
        None => Resolved::Skip(input),
      }
    }

    CmdKind::Regex { pattern, miss } => run_regex(ctx, id, &pattern, miss, input),

    CmdKind::Sleep { amount } => {
      let amount = populate_lenient(ctx, id, &amount);
      let delay = match parse_duration(&amount) {
        Ok(delay) => delay,
        Err(e) => {
          warn!(context_id = %ctx.id(), amount = %amount, error = %e, "unparseable sleep, continuing");
          return Resolved::Next(input);
        }
      };
      match mode {
        ExecMode::Activation { epoch } => {
          let resume = ctx.clone();
          let _ = ctx.core().dispatcher().schedule(
            delay,
            Box::pin(async move { resume.advance(epoch, input) }),
          );
          Resolved::Pending
        }
        ExecMode::Branch { .. } => {
          tokio::time::sleep(delay).await;
          Resolved::Next(input)
        }
      }
    }

    CmdKind::SetSignal {
      name,
      initial,
      forced,
    } => {
      let name = populate_lenient(ctx, id, &name);
      let initial = populate_lenient(ctx, id, &initial);
      match initial.trim().parse::<i64>() {
        Ok(count) => ctx.core().coordinator().set_signal(&name, count, forced),
        Err(_) => {
          error!(context_id = %ctx.id(), signal = %name, initial = %initial, "set-signal count is not a number, skipping declaration");
        }
      }
      Resolved::Next(input)
    }

    CmdKind::Signal { name } => {
      let name = populate_lenient(ctx, id, &name);
      ctx.core().coordinator().signal(&name);
      Resolved::Next(input)
    }

    CmdKind::WaitFor { name, initial } => {
      let name = populate_lenient(ctx, id, &name);
      if name.is_empty() {
        return Resolved::Next(input);
      }
      if let Some(initial) = initial {
        let initial = populate_lenient(ctx, id, &initial);
        match initial.trim().parse::<i64>() {
          Ok(count) => ctx.core().coordinator().set_signal(&name, count, false),
          Err(_) => {
            error!(context_id = %ctx.id(), signal = %name, initial = %initial, "wait-for initial count is not a number, ignoring");
          }
        }
      }
      match mode {
        ExecMode::Activation { epoch } => {
          let uid = ctx.graph().node(id).uid();
          let resume = ctx.clone();
          ctx.core().coordinator().wait_for(
            &name,
            Waiter::new(uid, input, move |value| resume.advance(epoch, value)),
          );
          Resolved::Pending
        }
        ExecMode::Branch { .. } => {
          warn!(context_id = %ctx.id(), signal = %name, "wait-for inside a branch is unsupported");
          Resolved::Pending
        }
      }
    }

    CmdKind::Countdown { name, initial } => {
      let name = populate_lenient(ctx, id, &name);
      let remaining = ctx.core().coordinator().decrease(&name, initial);
      if remaining <= 0 {
        Resolved::Next(input)
      } else {
        Resolved::Skip(input)
      }
    }

    CmdKind::ForEach { name, input: declared } => run_for_each(ctx, id, &name, declared.as_deref(), input),

    CmdKind::RepeatUntilSignal { name } => {
      let name = populate_lenient(ctx, id, &name);
      if name.is_empty() {
        return Resolved::Skip(input);
      }
      let remaining = ctx.core().coordinator().get_signal_count(&name);
      if remaining > 0 {
        Resolved::Next(input)
      } else {
        Resolved::Skip(input)
      }
    }

    CmdKind::ScriptCmd { name } => {
      let name = populate_lenient(ctx, id, &name);
      match ctx.core().script(&name) {
        Some(script) => {
          // graft a fresh copy in as our first then-child; `next` enters
          // the copy and its tail continues after this node
          ctx.graph_mut().graft_first(script.root_def(), id);
          Resolved::Next(input)
        }
        None => {
          warn!(context_id = %ctx.id(), script = %name, "could not find script");
          Resolved::Next(input)
        }
      }
    }

    CmdKind::CtrlC => {
      match mode {
        ExecMode::Branch {
          owner: Some((owner, owner_epoch)),
        } => {
          if ctx.is_current(owner, owner_epoch) {
            info!(context_id = %ctx.id(), "interrupting active command");
            ctx.session().request_cancel();
            ctx.abandon(owner_epoch);
          } else {
            debug!(context_id = %ctx.id(), "owner already resolved, interrupt skipped");
          }
        }
        _ => {
          ctx.session().request_cancel();
        }
      }
      Resolved::Next(input)
    }

    CmdKind::Code { code } => match (*code)(input, ctx.state().as_ref()) {
      CodeResult::Next(value) => Resolved::Next(value),
      CodeResult::Skip(value) => Resolved::Skip(value),
      CodeResult::Abort(message) => {
        error!(context_id = %ctx.id(), message = %message, "code command aborted run");
        Resolved::Abort {
          skip_cleanup: false,
        }
      }
    },
  }
}

async fn run_sh(
  ctx: &Arc<ScriptContext>,
  id: CmdId,
  command: &str,
  input: Value,
  mode: ExecMode,
) -> Resolved {
  let populated = match populate_for(ctx, id, command) {
    Ok(populated) => populated,
    Err(e) => {
      error!(
        context_id = %ctx.id(),
        command = %command,
        missing = ?e.missing,
        "failed to populate command, aborting run"
      );
      return Resolved::Abort {
        skip_cleanup: false,
      };
    }
  };
  match mode {
    ExecMode::Activation { epoch } => {
      let resume = ctx.clone();
      let core = ctx.core().clone();
      ctx.session().execute_async(
        &populated,
        Box::new(move |output| {
          // completion is routed through the callback pool so a slow
          // continuation cannot block the session's I/O task
          let ctx = resume.clone();
          core.dispatcher().submit_callback(Box::pin(async move {
            ctx.advance(epoch, json!(output));
          }));
        }),
      );
      Resolved::Pending
    }
    ExecMode::Branch { .. } => match ctx.session().execute(&populated).await {
      Ok(output) => Resolved::Next(json!(output)),
      Err(fleetrun_session::SessionError::Cancelled) => Resolved::Pending,
      Err(e) => {
        warn!(context_id = %ctx.id(), command = %populated, error = %e, "branch command failed");
        Resolved::Skip(input)
      }
    },
  }
}

fn run_regex(ctx: &Arc<ScriptContext>, id: CmdId, pattern: &str, miss: bool, input: Value) -> Resolved {
  let pattern = populate_lenient(ctx, id, pattern);
  let compiled = match Regex::new(&pattern) {
    Ok(compiled) => compiled,
    Err(e) => {
      warn!(context_id = %ctx.id(), pattern = %pattern, error = %e, "invalid regex, bypassing");
      return Resolved::Skip(input);
    }
  };
  let haystack = render(&input);
  match compiled.captures(&haystack) {
    Some(captures) => {
      for group in compiled.capture_names().flatten() {
        if let Some(matched) = captures.name(group) {
          ctx.state().set(group, convert_type(matched.as_str()));
        }
      }
      if miss {
        Resolved::Skip(input)
      } else {
        Resolved::Next(input)
      }
    }
    None => {
      if miss {
        Resolved::Next(input)
      } else {
        Resolved::Skip(input)
      }
    }
  }
}

fn run_for_each(
  ctx: &Arc<ScriptContext>,
  id: CmdId,
  name: &str,
  declared: Option<&str>,
  input: Value,
) -> Resolved {
  let name = populate_lenient(ctx, id, name);
  let declared = declared.map(|d| populate_lenient(ctx, id, d)).filter(|d| {
    // a declared input that never resolved is treated as absent
    !d.is_empty() && !has_placeholder(d)
  });

  let graph = ctx.graph();
  let node = graph.node(id);
  let element = node.with_state(|state| {
    // (re)load the sequence when this is a fresh entry into the loop or the
    // source text changed; mid-loop activations keep the loaded items
    match &declared {
      Some(source) => {
        if state.loop_items.is_empty() || state.loaded_input.as_deref() != Some(source.as_str()) {
          state.loop_items = split_text(source);
          state.loop_index = None;
          state.loaded_input = Some(source.clone());
        }
      }
      None => {
        let source = render(&input);
        if state.loop_items.is_empty() || state.loaded_input.as_deref() != Some(source.as_str()) {
          state.loop_items = split_items(&input);
          state.loop_index = None;
          state.loaded_input = Some(source);
        }
      }
    }
    let index = state.loop_index.map(|i| i + 1).unwrap_or(0);
    if index < state.loop_items.len() {
      state.loop_index = Some(index);
      let mut element = state.loop_items[index].clone();
      if let Value::String(s) = &element {
        element = Value::from(s.replace(['\r', '\n'], ""));
      }
      state.with.insert(name.clone(), element.clone());
      Some(element)
    } else {
      state.loop_items.clear();
      state.loop_index = None;
      None
    }
  });

  match element {
    Some(element) => {
      debug!(context_id = %ctx.id(), var = %name, element = %element, "for-each iteration");
      Resolved::Next(element)
    }
    None => Resolved::Skip(input),
  }
}

/// Split a piped value into loop elements.
fn split_items(input: &Value) -> Vec<Value> {
  match input {
    Value::Array(items) => items.clone(),
    Value::Object(map) => map
      .iter()
      .map(|(key, value)| json!({"key": key, "value": value}))
      .collect(),
    Value::String(text) => split_text(text),
    Value::Null => Vec::new(),
    other => vec![other.clone()],
  }
}

/// Split declared text: JSON arrays/objects, newline lists, or comma lists.
fn split_text(text: &str) -> Vec<Value> {
  let trimmed = text.trim();
  if trimmed.is_empty() {
    return Vec::new();
  }
  if trimmed.starts_with('[') || trimmed.starts_with('{') {
    if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
      return split_items(&parsed);
    }
  }
  if trimmed.contains('\n') {
    return trimmed
      .lines()
      .map(|line| Value::from(line.trim_end_matches('\r').to_string()))
      .collect();
  }
  trimmed
    .trim_start_matches('[')
    .trim_end_matches(']')
    .split(',')
    .map(|part| part.trim().trim_matches('"').trim_matches('\''))
    .filter(|part| !part.is_empty())
    .map(|part| Value::from(part.to_string()))
    .collect()
}

static DURATION: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"(?<amount>\d+)(?<unit>ms|s|m|h)?").expect("duration regex"));

/// Parse a duration like `500`, `750ms`, `2s`, `5m`, `1h30m`. Bare numbers
/// are milliseconds.
pub fn parse_duration(text: &str) -> Result<Duration, EngineError> {
  let cleaned = text.replace('_', "");
  let mut total = Duration::ZERO;
  let mut matched = false;
  for captures in DURATION.captures_iter(&cleaned) {
    matched = true;
    let amount: u64 = captures["amount"].parse().map_err(|_| EngineError::InvalidConfig {
      message: format!("invalid duration '{}'", text),
    })?;
    let unit = captures.name("unit").map(|m| m.as_str()).unwrap_or("ms");
    total += match unit {
      "h" => Duration::from_secs(amount * 3600),
      "m" => Duration::from_secs(amount * 60),
      "s" => Duration::from_secs(amount),
      _ => Duration::from_millis(amount),
    };
  }
  if matched {
    Ok(total)
  } else {
    Err(EngineError::InvalidConfig {
      message: format!("invalid duration '{}'", text),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn durations_parse() {
    assert_eq!(parse_duration("500").unwrap(), Duration::from_millis(500));
    assert_eq!(parse_duration("750ms").unwrap(), Duration::from_millis(750));
    assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
    assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
    assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
    assert!(parse_duration("soon").is_err());
  }

  #[test]
  fn split_handles_common_shapes() {
    assert_eq!(
      split_text("a, b, c"),
      vec![json!("a"), json!("b"), json!("c")]
    );
    assert_eq!(
      split_text("one\ntwo\r\nthree"),
      vec![json!("one"), json!("two"), json!("three")]
    );
    assert_eq!(split_text("[1, 2, 3]"), vec![json!(1), json!(2), json!(3)]);
    assert_eq!(split_items(&json!(["x", "y"])), vec![json!("x"), json!("y")]);
    assert_eq!(
      split_items(&json!({"k": "v"})),
      vec![json!({"key": "k", "value": "v"})]
    );
    assert!(split_text("").is_empty());
  }
}
