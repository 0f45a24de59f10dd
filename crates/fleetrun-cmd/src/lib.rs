//! Command graph model.
//!
//! Scripts are authored as owned trees of [`CmdDef`] templates and resolved
//! into arena-backed [`CmdGraph`] instances for execution. Node links
//! (`next`/`skip`) are arena indices, so the cycles created by loop splicing
//! carry no ownership cycles and instances can be dropped wholesale.

mod def;
mod graph;
mod kind;
mod node;
mod script;

pub use def::CmdDef;
pub use graph::{CmdGraph, CmdId};
pub use kind::{CmdKind, CodeFn, CodeResult};
pub use node::{Cmd, NodeState};
pub use script::{ResolvedScript, Script};
