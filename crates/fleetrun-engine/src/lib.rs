//! Execution engine.
//!
//! Drives resolved command graphs across bounded worker pools. A
//! [`ScriptContext`] is one script instance bound to one session; the
//! [`Dispatcher`] activates contexts and resumes them when a suspended
//! command's trigger fires (a latch reaching zero, a timer, or a session
//! completion); the [`Run`] owns the per-run shared pieces and the
//! setup → run → cleanup stage progression.

mod context;
mod dispatcher;
mod error;
mod exec;
mod run;

pub use context::ScriptContext;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::EngineError;
pub use exec::parse_duration;
pub use run::{Run, RunEvent, Stage};
