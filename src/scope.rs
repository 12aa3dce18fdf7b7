//! Task scopes: lifetime groups of tasks
//!
//! Every task belongs to exactly one scope for its whole life. A scope is
//! *drained* once its task set empties; draining raises the scope's drain
//! flag, which is what `run` and `nested` wait on. A scope also aggregates at
//! most one unclaimed task error, surfaced when the scope's entry point
//! returns.

use crate::driver::TaskKey;
use crate::error::{Result, RuntimeError};
use crate::flags::Flag;
use crate::runtime;
use std::collections::HashSet;

slotmap::new_key_type! {
    pub(crate) struct ScopeKey;
}

pub(crate) struct ScopeEntry {
    pub(crate) tasks: HashSet<TaskKey>,
    pub(crate) error: Option<RuntimeError>,
    pub(crate) drain_flag: Flag,
    pub(crate) label: &'static str,
}

impl ScopeEntry {
    pub(crate) fn new(label: &'static str) -> Self {
        ScopeEntry {
            tasks: HashSet::new(),
            error: None,
            drain_flag: Flag::new(),
            label,
        }
    }
}

/// A handle to a task scope.
///
/// Scopes created explicitly with [`Scope::new`] live until the runtime tears
/// down or their creator removes them; tasks can be spawned into them with
/// [`crate::spawn_in`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scope {
    key: ScopeKey,
}

impl Scope {
    /// Create a fresh scope on the active runtime.
    pub fn new() -> Result<Scope> {
        let key = runtime::with_driver(|d| d.create_scope("scope"))?;
        Ok(Scope { key })
    }

    pub(crate) fn key(&self) -> ScopeKey {
        self.key
    }

    /// Whether every task in this scope has terminated.
    pub fn is_drained(&self) -> Result<bool> {
        runtime::with_driver(|d| d.scope_is_drained(self.key))
    }
}
