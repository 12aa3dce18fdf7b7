//! Flags: opaque rendezvous identities between tasks
//!
//! A [`Flag`] is a cheap, clonable identity that tasks can wait on and raise.
//! Raising a flag moves every task currently waiting on it to the ready
//! queue, in the order they started waiting. Flags carry no value; they are
//! the low-level notification primitive underneath task completion, `select`
//! subscriptions, the idle signal, and scope draining.
//!
//! When every clone of a flag has been dropped while tasks still wait on it,
//! the waiters can never be woken by a raise; the driver's sweep cancels them
//! with [`RuntimeError::FlagSourceGone`].

use crate::driver::TaskKey;
use crate::error::{Deadline, Result, RuntimeError};
use crate::runtime;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

static NEXT_FLAG_ID: AtomicU64 = AtomicU64::new(1);

/// An opaque identity used as a rendezvous key between tasks.
///
/// Clones share the same identity. The flag itself is not a value: raising it
/// carries no payload, it only resumes the tasks waiting on it.
#[derive(Debug, Clone)]
pub struct Flag {
    inner: Rc<FlagId>,
}

#[derive(Debug)]
pub(crate) struct FlagId(u64);

impl Flag {
    /// Create a fresh flag identity.
    pub fn new() -> Self {
        Flag {
            inner: Rc::new(FlagId(NEXT_FLAG_ID.fetch_add(1, Ordering::Relaxed))),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.0
    }

    pub(crate) fn downgrade(&self) -> Weak<FlagId> {
        Rc::downgrade(&self.inner)
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Flag {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Flag {}

/// Maps flag identities to their FIFO waiter lists.
///
/// The table holds only a weak reference to each identity so that dropped
/// flags can be detected and their waiters drained.
#[derive(Default)]
pub(crate) struct FlagTable {
    entries: HashMap<u64, FlagEntry>,
}

struct FlagEntry {
    source: Weak<FlagId>,
    waiters: VecDeque<TaskKey>,
}

impl FlagTable {
    /// Append a waiter to the flag's list, creating the entry on first use.
    pub(crate) fn push_waiter(&mut self, flag: &Flag, task: TaskKey) {
        let entry = self.entries.entry(flag.id()).or_insert_with(|| FlagEntry {
            source: flag.downgrade(),
            waiters: VecDeque::new(),
        });
        entry.waiters.push_back(task);
    }

    /// Remove one waiter (timeout/cancel eviction).
    pub(crate) fn remove_waiter(&mut self, flag_id: u64, task: TaskKey) {
        if let Some(entry) = self.entries.get_mut(&flag_id) {
            entry.waiters.retain(|t| *t != task);
            if entry.waiters.is_empty() && entry.source.strong_count() == 0 {
                self.entries.remove(&flag_id);
            }
        }
    }

    /// Take the current waiter list of a flag. Waiters appended afterwards
    /// belong to the next raise.
    pub(crate) fn drain_waiters(&mut self, flag_id: u64) -> VecDeque<TaskKey> {
        match self.entries.get_mut(&flag_id) {
            Some(entry) => std::mem::take(&mut entry.waiters),
            None => VecDeque::new(),
        }
    }

    pub(crate) fn has_waiters(&self, flag_id: u64) -> bool {
        self.entries
            .get(&flag_id)
            .map(|e| !e.waiters.is_empty())
            .unwrap_or(false)
    }

    /// Remove entries whose identity has been dropped, returning the orphaned
    /// waiters so the driver can cancel them.
    pub(crate) fn take_dead(&mut self) -> Vec<(u64, VecDeque<TaskKey>)> {
        let dead: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.source.strong_count() == 0)
            .map(|(id, _)| *id)
            .collect();
        dead.into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|e| (id, e.waiters)))
            .collect()
    }
}

/// Raise a flag: every task currently waiting on it is moved to the ready
/// queue in FIFO order. Returns the number of waiters resumed.
pub fn raise_flag(flag: &Flag) -> Result<usize> {
    runtime::with_driver(|d| d.raise_flag_internal(flag))
}

/// Suspend the current task until `flag` is raised, or until the timeout
/// (default when `None`) elapses with [`RuntimeError::Timeout`].
pub async fn await_flag(flag: &Flag, timeout: Option<Duration>) -> Result<()> {
    FlagWait::new(flag.clone(), Deadline::Default(timeout)).await
}

/// Wait on a flag with no deadline. Internal waits only (scope drain,
/// publisher demand); the wake source is guaranteed by the caller.
pub(crate) async fn await_flag_forever(flag: &Flag) -> Result<()> {
    FlagWait::new(flag.clone(), Deadline::Never).await
}

/// Wait on a flag until an absolute deadline (used by `select`, which shares
/// one deadline across several wait iterations).
pub(crate) async fn await_flag_until(flag: &Flag, deadline: std::time::Instant) -> Result<()> {
    FlagWait::new(flag.clone(), Deadline::At(deadline)).await
}

pub(crate) struct FlagWait {
    /// Taken at registration so a parked waiter does not keep the flag
    /// identity alive (otherwise a dropped source could never be detected).
    flag: Option<Flag>,
    deadline: Deadline,
    registered: bool,
    task: Option<TaskKey>,
}

impl FlagWait {
    pub(crate) fn new(flag: Flag, deadline: Deadline) -> Self {
        FlagWait {
            flag: Some(flag),
            deadline,
            registered: false,
            task: None,
        }
    }
}

impl Future for FlagWait {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let step = runtime::with_driver(|d| {
            let me = match d.current_task() {
                Some(k) => k,
                None => {
                    return Poll::Ready(Err(RuntimeError::usage(
                        "await_flag requires a running task",
                    )))
                }
            };
            if let Some(err) = d.take_planned(me) {
                return Poll::Ready(Err(err));
            }
            if !this.registered {
                let Some(flag) = this.flag.take() else {
                    return Poll::Ready(Err(RuntimeError::usage("flag wait polled after use")));
                };
                this.registered = true;
                this.task = Some(me);
                let deadline = d.resolve_deadline(this.deadline);
                d.park_on_flag(me, &flag, deadline);
                Poll::Pending
            } else if d.task_is_running(me) {
                Poll::Ready(Ok(()))
            } else {
                // woken spuriously by a foreign waker while still parked
                Poll::Pending
            }
        });
        match step {
            Ok(poll) => poll,
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl Drop for FlagWait {
    fn drop(&mut self) {
        if !self.registered {
            return;
        }
        if let Some(task) = self.task {
            let _ = runtime::with_driver(|d| d.abandon_wait(task));
        }
    }
}

/// Wait until the driver is about to go idle.
///
/// The driver raises the idle flag whenever a tick computes a positive sleep
/// budget, i.e. the loop would otherwise block in the multiplexer.
pub async fn idle(timeout: Option<Duration>) -> Result<()> {
    let flag = runtime::with_driver(|d| d.idle_flag())?;
    await_flag(&flag, timeout).await
}
