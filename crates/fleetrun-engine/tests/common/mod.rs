//! Test support: a scripted session and a shared event log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetrun_cmd::{CmdDef, CodeResult};
use fleetrun_session::{CompletionFn, Session, SessionError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Shared ordered log the test scripts append to.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn event_log() -> EventLog {
  Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &EventLog) -> Vec<String> {
  log.lock().unwrap().clone()
}

/// A code command that appends `label` and passes its input through.
pub fn marker(log: &EventLog, label: &str) -> CmdDef {
  let log = log.clone();
  let label = label.to_string();
  CmdDef::code(move |input, _state| {
    log.lock().unwrap().push(label.clone());
    CodeResult::Next(input)
  })
}

/// A code command that appends its rendered input and passes it through.
pub fn recorder(log: &EventLog) -> CmdDef {
  let log = log.clone();
  CmdDef::code(move |input, _state| {
    log.lock().unwrap().push(fleetrun_state::render(&input));
    CodeResult::Next(input)
  })
}

/// Session stub driven by command-string conventions:
///
/// - `echo <text>`: emits `<text>` as a line and completes with it
/// - `stream:a|b|c`: emits each part as a line (with a small delay between
///   parts) and completes with the joined output — unless cancelled first
/// - `hang`: emits one line and then blocks until cancelled; never completes
/// - anything else: completes immediately with `ok`
pub struct ScriptedSession {
  host: String,
  open: AtomicBool,
  fail_connect: bool,
  lines: broadcast::Sender<String>,
  current: Mutex<Option<CancellationToken>>,
  pub executed: Arc<Mutex<Vec<String>>>,
}

impl ScriptedSession {
  pub fn new(host: &str) -> Arc<Self> {
    let (lines, _) = broadcast::channel(256);
    Arc::new(Self {
      host: host.to_string(),
      open: AtomicBool::new(false),
      fail_connect: false,
      lines,
      current: Mutex::new(None),
      executed: Arc::new(Mutex::new(Vec::new())),
    })
  }

  pub fn failing(host: &str) -> Arc<Self> {
    let (lines, _) = broadcast::channel(256);
    Arc::new(Self {
      host: host.to_string(),
      open: AtomicBool::new(false),
      fail_connect: true,
      lines,
      current: Mutex::new(None),
      executed: Arc::new(Mutex::new(Vec::new())),
    })
  }

  fn register(&self, token: CancellationToken) {
    let mut current = self.current.lock().unwrap();
    if let Some(previous) = current.replace(token) {
      previous.cancel();
    }
  }

  async fn play(
    command: String,
    lines: broadcast::Sender<String>,
    cancel: CancellationToken,
  ) -> Option<String> {
    if let Some(text) = command.strip_prefix("echo ") {
      let _ = lines.send(text.to_string());
      return Some(text.to_string());
    }
    if let Some(parts) = command.strip_prefix("stream:") {
      let mut collected = Vec::new();
      for part in parts.split('|') {
        tokio::select! {
          _ = tokio::time::sleep(Duration::from_millis(40)) => {}
          _ = cancel.cancelled() => return None,
        }
        let _ = lines.send(part.to_string());
        collected.push(part.to_string());
      }
      return Some(collected.join("\n"));
    }
    if command == "hang" {
      let _ = lines.send("hanging".to_string());
      cancel.cancelled().await;
      return None;
    }
    Some("ok".to_string())
  }
}

#[async_trait]
impl Session for ScriptedSession {
  fn host(&self) -> &str {
    &self.host
  }

  async fn open(&self) -> Result<(), SessionError> {
    if self.fail_connect {
      return Err(SessionError::Connect {
        host: self.host.clone(),
        message: "refused".to_string(),
      });
    }
    self.open.store(true, Ordering::SeqCst);
    Ok(())
  }

  async fn execute(&self, command: &str) -> Result<String, SessionError> {
    self.executed.lock().unwrap().push(command.to_string());
    let token = CancellationToken::new();
    self.register(token.clone());
    match Self::play(command.to_string(), self.lines.clone(), token).await {
      Some(output) => Ok(output),
      None => Err(SessionError::Cancelled),
    }
  }

  fn execute_async(&self, command: &str, on_complete: CompletionFn) {
    self.executed.lock().unwrap().push(command.to_string());
    let token = CancellationToken::new();
    self.register(token.clone());
    let command = command.to_string();
    let lines = self.lines.clone();
    tokio::spawn(async move {
      if let Some(output) = Self::play(command, lines, token).await {
        on_complete(output);
      }
    });
  }

  fn subscribe_lines(&self) -> broadcast::Receiver<String> {
    self.lines.subscribe()
  }

  fn request_cancel(&self) {
    if let Some(token) = self.current.lock().unwrap().take() {
      token.cancel();
    }
  }

  fn is_open(&self) -> bool {
    self.open.load(Ordering::SeqCst)
  }

  async fn close(&self) {
    self.request_cancel();
    self.open.store(false, Ordering::SeqCst);
  }
}
