//! Select: wait for the first ready source among several
//!
//! Every input is viewed through the [`Selectable`] trait: a readiness probe
//! plus the ability to subscribe a shared notification flag. `select`
//! registers one fresh flag with every input, waits on it, and rescans the
//! inputs in their original order, so ties are always resolved in favor of
//! the first-listed ready input. A wake with no ready input simply loops.

use crate::driver::TaskKey;
use crate::error::{Result, RuntimeError};
use crate::flags::{self, Flag};
use crate::io::{Interest, IoKey, IoWakee};
use crate::runtime;
use crate::task::JoinHandle;
use std::cell::Cell;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

/// A uniform "ready + subscribe" view over tasks, channels, and handles.
pub trait Selectable {
    /// Whether the underlying operation would complete without blocking.
    fn is_ready(&self) -> bool;

    /// Subscribe `flag` to be raised when readiness may have changed.
    fn register(&self, flag: &Flag) -> Result<()>;

    /// Remove a previously registered subscription.
    fn unregister(&self, flag: &Flag);
}

/// Ready when the task has terminated.
impl<T> Selectable for JoinHandle<T> {
    fn is_ready(&self) -> bool {
        self.is_finished()
    }

    fn register(&self, flag: &Flag) -> Result<()> {
        let key: TaskKey = self.key();
        runtime::with_driver(|d| d.add_task_notify(key, flag))
    }

    fn unregister(&self, flag: &Flag) {
        let key: TaskKey = self.key();
        let _ = runtime::with_driver(|d| d.remove_task_notify(key, flag));
    }
}

/// Readiness view over a raw handle.
///
/// Registering creates a flag-subscribed entry in the I/O registry; the
/// first multiplex pass that observes readiness records the mask and raises
/// the select flag.
#[derive(Debug)]
pub struct HandleSelector {
    fd: RawFd,
    interest: Interest,
    entry: Cell<Option<IoKey>>,
}

impl HandleSelector {
    pub fn new<H: AsRawFd>(handle: &H, interest: Interest) -> Self {
        HandleSelector {
            fd: handle.as_raw_fd(),
            interest,
            entry: Cell::new(None),
        }
    }

    /// Select on read readiness of `handle`.
    pub fn readable<H: AsRawFd>(handle: &H) -> Self {
        Self::new(handle, Interest::READABLE)
    }

    /// Select on write readiness of `handle`.
    pub fn writable<H: AsRawFd>(handle: &H) -> Self {
        Self::new(handle, Interest::WRITABLE)
    }
}

impl Selectable for HandleSelector {
    fn is_ready(&self) -> bool {
        match self.entry.get() {
            Some(key) => runtime::with_driver(|d| d.io_resolved(key).is_some()).unwrap_or(false),
            None => false,
        }
    }

    fn register(&self, flag: &Flag) -> Result<()> {
        let key = runtime::try_with_driver(|d| {
            d.register_io(self.fd, self.interest, IoWakee::Flag(flag.clone()))
        })?;
        self.entry.set(Some(key));
        Ok(())
    }

    fn unregister(&self, _flag: &Flag) {
        if let Some(key) = self.entry.take() {
            let _ = runtime::with_driver(|d| d.remove_io(key));
        }
    }
}

/// Unregisters every subscribed input when the select ends, including on
/// early error returns and cancellation.
struct SelectGuard<'a> {
    items: &'a [&'a dyn Selectable],
    flag: Flag,
    registered: usize,
}

impl Drop for SelectGuard<'_> {
    fn drop(&mut self) {
        for item in &self.items[..self.registered] {
            item.unregister(&self.flag);
        }
    }
}

/// Wait until one of `items` is ready and return its index, or `None` on
/// timeout. An empty input list returns `None` immediately, and if several
/// inputs are already ready the first-listed one wins without blocking.
pub async fn select(
    items: &[&dyn Selectable],
    timeout: Option<Duration>,
) -> Result<Option<usize>> {
    if items.is_empty() {
        return Ok(None);
    }
    for (index, item) in items.iter().enumerate() {
        if item.is_ready() {
            return Ok(Some(index));
        }
    }

    let flag = Flag::new();
    let mut guard = SelectGuard {
        items,
        flag: flag.clone(),
        registered: 0,
    };
    for item in items {
        item.register(&flag)?;
        guard.registered += 1;
    }

    let deadline = runtime::with_driver(|d| d.deadline_after(timeout))?;
    loop {
        for (index, item) in items.iter().enumerate() {
            if item.is_ready() {
                return Ok(Some(index));
            }
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        match flags::await_flag_until(&flag, deadline).await {
            Ok(()) => continue,
            Err(RuntimeError::Timeout) => return Ok(None),
            Err(e) => return Err(e),
        }
    }
}
