//! Runtime entry points: `run`, `nested`, and the thread-local driver
//!
//! A driver is installed per thread for the duration of the outermost
//! [`run`] call. The runtime on a thread is reached through a thread-local
//! slot; suspension primitives borrow it for short, non-reentrant critical
//! sections while no task-poll is in progress on the same borrow.

use crate::config::RuntimeConfig;
use crate::driver::{self, Driver};
use crate::error::{Result, RuntimeError};
use crate::flags;
use crate::scope::Scope;
use crate::task;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use tracing::{debug, warn};

thread_local! {
    /// The driver installed on this thread, if any. Tasks schedule through
    /// this slot, so it must outlive every task poll of the current `run`.
    static DRIVER: RefCell<Option<Rc<RefCell<Driver>>>> = const { RefCell::new(None) };
}

/// Borrow the active driver for a short critical section.
pub(crate) fn with_driver<R>(f: impl FnOnce(&mut Driver) -> R) -> Result<R> {
    DRIVER.with(|cell| {
        let slot = cell.borrow();
        match slot.as_ref() {
            Some(rt) => Ok(f(&mut rt.borrow_mut())),
            None => Err(RuntimeError::usage("no runtime is active on this thread")),
        }
    })
}

/// Like [`with_driver`] for closures that are themselves fallible.
pub(crate) fn try_with_driver<R>(f: impl FnOnce(&mut Driver) -> Result<R>) -> Result<R> {
    match with_driver(f) {
        Ok(inner) => inner,
        Err(e) => Err(e),
    }
}

/// Clone out the driver handle (used to poll tasks outside the borrow).
pub(crate) fn driver_handle() -> Result<Rc<RefCell<Driver>>> {
    DRIVER.with(|cell| {
        cell.borrow()
            .as_ref()
            .cloned()
            .ok_or_else(|| RuntimeError::usage("no runtime is active on this thread"))
    })
}

fn install(config: RuntimeConfig) -> Result<Rc<RefCell<Driver>>> {
    DRIVER.with(|cell| {
        if cell.borrow().is_some() {
            return Err(RuntimeError::usage(
                "run() is not reentrant; use nested() from inside the runtime",
            ));
        }
        let rt = Rc::new(RefCell::new(Driver::new(config)?));
        *cell.borrow_mut() = Some(rt.clone());
        Ok(rt)
    })
}

fn uninstall() {
    // take in two steps so destructors never observe an active borrow
    let taken = DRIVER.with(|cell| cell.borrow_mut().take());
    drop(taken);
}

/// A configured runtime instance.
///
/// Carries the configuration plus the enter/exit hooks invoked around the
/// outermost [`Runtime::run`] call.
pub struct Runtime {
    config: RuntimeConfig,
    on_enter: Vec<Box<dyn Fn()>>,
    on_exit: Vec<Box<dyn Fn()>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("on_enter", &self.on_enter.len())
            .field("on_exit", &self.on_exit.len())
            .finish()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Runtime {
            config,
            on_enter: Vec::new(),
            on_exit: Vec::new(),
        }
    }

    /// Register a hook invoked once when the outermost `run` enters.
    pub fn on_enter(mut self, hook: impl Fn() + 'static) -> Self {
        self.on_enter.push(Box::new(hook));
        self
    }

    /// Register a hook invoked once when the outermost `run` exits.
    pub fn on_exit(mut self, hook: impl Fn() + 'static) -> Self {
        self.on_exit.push(Box::new(hook));
        self
    }

    /// Install the driver, run `future` as the root task, and pump ticks
    /// until the root scope drains.
    ///
    /// Returns the root task's value, or the first unclaimed error with the
    /// root task's own error preferred over descendants'.
    pub fn run<T, F>(self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + 'static,
        T: 'static,
    {
        let Runtime {
            config,
            on_enter,
            on_exit,
        } = self;
        let rt = install(config)?;
        debug!("runtime started");
        for hook in &on_enter {
            hook();
        }

        let result = run_root(&rt, future);

        for hook in &on_exit {
            hook();
        }
        let leftover = rt.borrow().live_tasks();
        if leftover > 0 {
            warn!(count = leftover, "dropping tasks still alive at runtime exit");
        }
        uninstall();
        debug!("runtime stopped");
        result
    }
}

fn run_root<T, F>(rt: &Rc<RefCell<Driver>>, future: F) -> Result<T>
where
    F: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    let root_scope = rt.borrow().root_scope();
    let mut handle = task::spawn_scoped(root_scope, None, future)?;

    while !rt.borrow().scope_is_drained(root_scope) {
        driver::tick(rt);
    }

    let scope_error = rt.borrow_mut().take_scope_error(root_scope);
    match handle.claim_now() {
        Ok(value) => match scope_error {
            Some(err) => Err(err),
            None => Ok(value),
        },
        Err(err) => Err(err),
    }
}

/// Run a future to completion on a fresh runtime with default configuration.
///
/// This is the top-level entry point; it must not be called while a runtime
/// is already active on the thread (use [`nested`] for that).
pub fn run<T, F>(future: F) -> Result<T>
where
    F: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    Runtime::new().run(future)
}

/// Re-enter the runtime from inside a task: run `future` as the root of an
/// independent scope and wait for that scope to drain.
///
/// Unlike [`run`], this never pumps the driver; the calling task simply
/// suspends until the nested scope's drain flag is raised, so an inner
/// lifetime scope can complete without blocking the outer one.
pub async fn nested<T, F>(future: F) -> Result<T>
where
    F: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    let scope = Scope::new()?;
    let mut handle = task::spawn_in(&scope, future)?;

    // the spawned root may already have finished during its eager start
    let pending = with_driver(|d| {
        if d.scope_is_drained(scope.key()) {
            None
        } else {
            d.scope_drain_flag(scope.key()).ok()
        }
    })?;
    if let Some(drain) = pending {
        flags::await_flag_forever(&drain).await?;
    }

    let scope_error = with_driver(|d| {
        let err = d.take_scope_error(scope.key());
        d.remove_scope(scope.key());
        err
    })?;
    match handle.claim_now() {
        Ok(value) => match scope_error {
            Some(err) => Err(err),
            None => Ok(value),
        },
        Err(err) => Err(err),
    }
}
