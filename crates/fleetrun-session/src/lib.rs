//! Session contract.
//!
//! The engine treats a session purely as an address to send command text to
//! and receive text back from: a blocking call, a callback call, and a line
//! stream for watchers. Transport, prompt detection, and reconnection policy
//! live behind the trait and are not the engine's concern.

mod local;

pub use local::LocalSession;

use async_trait::async_trait;
use tokio::sync::broadcast;

/// Callback invoked with the final output of an async command execution.
///
/// Never invoked when the command is cancelled — a cancelled command's
/// owner is abandoned, not completed.
pub type CompletionFn = Box<dyn FnOnce(String) + Send + 'static>;

/// Errors surfaced by a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
  /// The session could not be opened.
  #[error("failed to open session to {host}: {message}")]
  Connect { host: String, message: String },

  /// The session is closed.
  #[error("session to {host} is closed")]
  Closed { host: String },

  /// The in-flight command was cancelled.
  #[error("command cancelled")]
  Cancelled,

  /// The command could not be spawned or its output could not be read.
  #[error("command failed: {message}")]
  Exec { message: String },
}

/// One remote (or local) shell endpoint bound to a script context.
#[async_trait]
pub trait Session: Send + Sync {
  /// Host label for logging and diagnostics.
  fn host(&self) -> &str;

  /// Open the session. Called once during the connect phase; a failure
  /// fails the whole phase.
  async fn open(&self) -> Result<(), SessionError>;

  /// Run a command and return its collected output once it completes.
  async fn execute(&self, command: &str) -> Result<String, SessionError>;

  /// Run a command, invoking `on_complete` with the collected output from
  /// the session's I/O thread when it finishes. Output lines produced while
  /// the command runs are published to [`Session::subscribe_lines`].
  fn execute_async(&self, command: &str, on_complete: CompletionFn);

  /// Subscribe to the line stream of the currently running (and future)
  /// commands.
  fn subscribe_lines(&self) -> broadcast::Receiver<String>;

  /// Best-effort interrupt of the in-flight command. The command's
  /// completion callback is dropped, not invoked.
  fn request_cancel(&self);

  /// Whether the session is usable.
  fn is_open(&self) -> bool;

  /// Close the session, interrupting any in-flight command.
  async fn close(&self);
}
