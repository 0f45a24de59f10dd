//! Local-process session.
//!
//! Runs each command through a local shell child process. Stdout and stderr
//! lines are published to subscribers as they arrive; the collected stdout is
//! the command's output. `request_cancel` kills the child and drops the
//! pending completion.

use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{CompletionFn, Session, SessionError};

const LINE_CHANNEL_CAPACITY: usize = 256;

pub struct LocalSession {
  host: String,
  shell: String,
  open: AtomicBool,
  lines: broadcast::Sender<String>,
  current: Mutex<Option<CancellationToken>>,
}

impl LocalSession {
  pub fn new() -> Self {
    Self::with_shell("sh")
  }

  pub fn with_shell(shell: impl Into<String>) -> Self {
    let (lines, _) = broadcast::channel(LINE_CHANNEL_CAPACITY);
    Self {
      host: "localhost".to_string(),
      shell: shell.into(),
      open: AtomicBool::new(false),
      lines,
      current: Mutex::new(None),
    }
  }

  /// Register the cancellation token of a new in-flight command, cancelling
  /// any previous one still registered.
  fn register(&self, token: CancellationToken) {
    let mut current = self.current.lock().expect("session lock poisoned");
    if let Some(previous) = current.replace(token) {
      previous.cancel();
    }
  }

  fn clear(&self) {
    self.current.lock().expect("session lock poisoned").take();
  }

}

async fn run_child(
  shell: &str,
  host: &str,
  lines: &broadcast::Sender<String>,
  command: &str,
  cancel: CancellationToken,
) -> Result<String, SessionError> {
  let mut child = Command::new(shell)
    .arg("-c")
    .arg(command)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true)
    .spawn()
    .map_err(|e| SessionError::Exec {
      message: format!("spawn '{}': {}", command, e),
    })?;

  let stdout = child.stdout.take().expect("piped stdout");
  let stderr = child.stderr.take().expect("piped stderr");

  // stderr lines go to subscribers but not into the collected output
  let stderr_lines = lines.clone();
  let stderr_task = tokio::spawn(async move {
    let mut reader = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = reader.next_line().await {
      let _ = stderr_lines.send(line);
    }
  });

  let mut collected = Vec::new();
  let mut reader = BufReader::new(stdout).lines();
  loop {
    tokio::select! {
      line = reader.next_line() => {
        match line {
          Ok(Some(line)) => {
            let _ = lines.send(line.clone());
            collected.push(line);
          }
          Ok(None) => break,
          Err(e) => {
            stderr_task.abort();
            return Err(SessionError::Exec { message: format!("read output: {}", e) });
          }
        }
      }
      _ = cancel.cancelled() => {
        warn!(host = %host, command = %command, "command cancelled, killing child");
        let _ = child.kill().await;
        stderr_task.abort();
        return Err(SessionError::Cancelled);
      }
    }
  }
  let _ = child.wait().await;
  let _ = stderr_task.await;
  Ok(collected.join("\n"))
}

impl Default for LocalSession {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl Session for LocalSession {
  fn host(&self) -> &str {
    &self.host
  }

  async fn open(&self) -> Result<(), SessionError> {
    self.open.store(true, Ordering::SeqCst);
    Ok(())
  }

  async fn execute(&self, command: &str) -> Result<String, SessionError> {
    if !self.is_open() {
      return Err(SessionError::Closed {
        host: self.host.clone(),
      });
    }
    let token = CancellationToken::new();
    self.register(token.clone());
    let result = run_child(&self.shell, &self.host, &self.lines, command, token).await;
    self.clear();
    result
  }

  fn execute_async(&self, command: &str, on_complete: CompletionFn) {
    let command = command.to_string();
    let shell = self.shell.clone();
    let host = self.host.clone();
    let lines = self.lines.clone();
    let token = CancellationToken::new();
    self.register(token.clone());
    let open = self.is_open();

    tokio::spawn(async move {
      if !open {
        warn!(host = %host, "execute_async on closed session, dropping command");
        return;
      }
      match run_child(&shell, &host, &lines, &command, token).await {
        Ok(output) => on_complete(output),
        Err(SessionError::Cancelled) => {
          debug!(command = %command, "cancelled command abandoned");
        }
        Err(e) => {
          warn!(command = %command, error = %e, "command failed, completing with empty output");
          on_complete(String::new());
        }
      }
    });
  }

  fn subscribe_lines(&self) -> broadcast::Receiver<String> {
    self.lines.subscribe()
  }

  fn request_cancel(&self) {
    if let Some(token) = self.current.lock().expect("session lock poisoned").take() {
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

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(flavor = "multi_thread")]
  async fn execute_collects_output() {
    let session = LocalSession::new();
    session.open().await.unwrap();
    let out = session.execute("echo one && echo two").await.unwrap();
    assert_eq!(out, "one\ntwo");
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn lines_are_streamed() {
    let session = LocalSession::new();
    session.open().await.unwrap();
    let mut rx = session.subscribe_lines();
    session.execute("echo first && echo second").await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), "first");
    assert_eq!(rx.recv().await.unwrap(), "second");
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn cancel_drops_completion() {
    let session = std::sync::Arc::new(LocalSession::new());
    session.open().await.unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<String>();
    let tx = std::sync::Mutex::new(Some(tx));
    session.execute_async(
      "sleep 5 && echo done",
      Box::new(move |out| {
        if let Some(tx) = tx.lock().unwrap().take() {
          let _ = tx.send(out);
        }
      }),
    );
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    session.request_cancel();
    let raced = tokio::time::timeout(std::time::Duration::from_millis(500), rx).await;
    assert!(raced.is_err() || raced.unwrap().is_err(), "completion should never fire");
  }
}
