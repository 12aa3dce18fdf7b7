//! Task spawning, joining, cancellation, and deferred cleanup
//!
//! A spawned task starts running immediately and keeps going until its first
//! suspension point; from then on the driver resumes it. Its result lands in
//! a join slot shared with the [`JoinHandle`]. Joining rethrows the task's
//! error; an error nobody claims escalates to the nearest live ancestor when
//! the task is collected.

use crate::driver::{self, TaskKey};
use crate::error::{Result, RuntimeError};
use crate::flags;
use crate::runtime;
use crate::scope::{Scope, ScopeKey};
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

pub(crate) struct JoinState<T> {
    result: Option<Result<T>>,
    finished: bool,
}

/// Owner handle for a spawned task.
///
/// Dropping the handle detaches the task: it keeps running, and an eventual
/// unclaimed error escalates to the nearest live ancestor.
pub struct JoinHandle<T> {
    key: TaskKey,
    state: Rc<RefCell<JoinState<T>>>,
    claimed: bool,
}

impl<T> std::fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle")
            .field("task", &self.key)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl<T> JoinHandle<T> {
    /// Whether the task has terminated (normally or with an error).
    pub fn is_finished(&self) -> bool {
        self.state.borrow().finished
    }

    /// Wait for the task and return its result, using the default timeout.
    ///
    /// Rethrows the task's own error. Fails with
    /// [`RuntimeError::CyclicAwait`] when the wait would close a cycle in the
    /// awaiter graph, and with [`RuntimeError::Timeout`] when the deadline
    /// elapses first (the task keeps running in that case).
    pub async fn join(&mut self) -> Result<T> {
        self.join_deadline(None).await
    }

    /// Wait for the task with an explicit timeout.
    pub async fn join_timeout(&mut self, timeout: Duration) -> Result<T> {
        self.join_deadline(Some(timeout)).await
    }

    async fn join_deadline(&mut self, timeout: Option<Duration>) -> Result<T> {
        if self.claimed {
            return Err(RuntimeError::usage("task result already claimed"));
        }
        if !self.state.borrow().finished {
            let flag = runtime::try_with_driver(|d| d.prepare_join(self.key))?;
            let waited = flags::await_flag(&flag, timeout).await;
            let _ = runtime::with_driver(|d| d.clear_awaiting());
            waited?;
        }
        self.claim_now()
    }

    /// Claim the result of an already-terminated task without suspending.
    pub(crate) fn claim_now(&mut self) -> Result<T> {
        if !self.state.borrow().finished {
            return Err(RuntimeError::usage("task has not terminated yet"));
        }
        self.claimed = true;
        let _ = runtime::with_driver(|d| d.claim(self.key));
        match self.state.borrow_mut().result.take() {
            Some(result) => result,
            None => Err(RuntimeError::usage("task result already claimed")),
        }
    }

    /// Cancel the task with the default [`RuntimeError::Cancelled`] error.
    ///
    /// The task must be suspended in a runtime wait structure; cancelling a
    /// running, queued, or terminated task fails with
    /// [`RuntimeError::NotBlocked`].
    pub fn cancel(&self) -> Result<()> {
        self.cancel_with(RuntimeError::Cancelled)
    }

    /// Cancel the task with a caller-supplied error.
    pub fn cancel_with(&self, err: RuntimeError) -> Result<()> {
        runtime::try_with_driver(|d| d.cancel_task(self.key, err))
    }

    pub(crate) fn key(&self) -> TaskKey {
        self.key
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if !self.claimed {
            let _ = runtime::with_driver(|d| d.abandon_handle(self.key));
        }
    }
}

/// Spawn a task into the current task's scope (or the root scope when called
/// from outside any task).
///
/// The task starts immediately and runs until its first suspension point
/// before `spawn` returns.
pub fn spawn<T, F>(future: F) -> Result<JoinHandle<T>>
where
    F: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    let (scope, parent) = runtime::with_driver(|d| {
        let parent = d.current_task();
        let scope = parent
            .and_then(|key| d.task_scope(key))
            .unwrap_or_else(|| d.root_scope());
        (scope, parent)
    })?;
    spawn_scoped(scope, parent, future)
}

/// Spawn a task into an explicit scope.
pub fn spawn_in<T, F>(scope: &Scope, future: F) -> Result<JoinHandle<T>>
where
    F: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    let parent = runtime::with_driver(|d| d.current_task())?;
    spawn_scoped(scope.key(), parent, future)
}

/// Spawn `count` tasks from a factory and collect their results in order.
///
/// Each entry in the returned list is the corresponding task's own result,
/// so individual failures don't abort the batch.
pub fn spawn_batch<T, F, Fut>(count: usize, factory: F) -> Result<JoinHandle<Vec<Result<T>>>>
where
    F: Fn(usize) -> Fut + 'static,
    Fut: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    spawn(async move {
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            handles.push(spawn(factory(index))?);
        }
        let mut results = Vec::with_capacity(count);
        for mut handle in handles {
            results.push(handle.join().await);
        }
        Ok(results)
    })
}

/// Spawn a long-lived helper outside the caller's scope.
///
/// Service tasks do not keep `run` or `nested` from returning; they are
/// expected to terminate on their own, and any still alive at runtime exit
/// are dropped with a warning.
pub fn service<T, F>(future: F) -> Result<JoinHandle<T>>
where
    F: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    let scope = runtime::with_driver(|d| d.service_scope())?;
    spawn_scoped(scope, None, future)
}

/// Register a closure to run after the current task completes.
///
/// Deferred closures run as micro-tasks in reverse insertion order, whether
/// the task returned, failed, or was cancelled.
pub fn defer(f: impl FnOnce() + 'static) -> Result<()> {
    runtime::try_with_driver(|d| d.defer_current(Box::new(f)))
}

pub(crate) fn spawn_scoped<T, F>(
    scope: ScopeKey,
    parent: Option<TaskKey>,
    future: F,
) -> Result<JoinHandle<T>>
where
    F: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    let state = Rc::new(RefCell::new(JoinState {
        result: None,
        finished: false,
    }));
    let slot = state.clone();
    let wrapped = async move {
        let output = future.await;
        if let Err(err) = &output {
            // recorded on the entry so an unclaimed error can escalate
            let _ = runtime::with_driver(|d| d.record_failure_current(err.clone()));
        }
        let mut s = slot.borrow_mut();
        s.result = Some(output);
        s.finished = true;
    };
    let key = runtime::try_with_driver(|d| d.register_task(scope, parent, Box::pin(wrapped)))?;

    // start the task now; its first suspension parks it in the right structure
    let rt = runtime::driver_handle()?;
    driver::poll_task(&rt, key);

    Ok(JoinHandle {
        key,
        state,
        claimed: false,
    })
}
