//! Engine error types.

use fleetrun_session::SessionError;

/// Errors that can occur while configuring or driving a run.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  /// A script reference did not resolve. Configuration-time: the run is
  /// refused, not retried.
  #[error("unknown script '{name}'")]
  UnknownScript { name: String },

  /// A declared value could not be parsed (latch count, duration, pattern).
  #[error("invalid configuration: {message}")]
  InvalidConfig { message: String },

  /// A required session failed to connect; fails the whole connect phase.
  #[error("failed to connect session for {host}")]
  Connect {
    host: String,
    #[source]
    source: SessionError,
  },

  /// The run was aborted.
  #[error("run aborted")]
  Aborted,
}
