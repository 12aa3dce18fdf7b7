//! I/O readiness: the multiplexer registry, `stream`/`readable`/`writable`,
//! and the non-blocking handle wrapper
//!
//! The registry owns the `mio::Poll` instance that doubles as the driver's
//! sleep mechanism: every tick polls it with the computed budget, and the
//! cross-thread waker interrupts the sleep when an external `Waker` fires.
//!
//! At most one task may wait on a given file descriptor. The resolved
//! readiness mask is recorded on the entry and handed to the waiting task
//! exactly once when it resumes.

use crate::driver::TaskKey;
use crate::error::{Deadline, Result, RuntimeError};
use crate::flags::Flag;
use crate::runtime;
use mio::unix::SourceFd;
use mio::Token;
use slotmap::{Key, KeyData, SlotMap};
use std::collections::HashMap;
use std::future::Future;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::warn;

slotmap::new_key_type! {
    pub(crate) struct IoKey;
}

/// Token reserved for the cross-thread waker.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Event buffer size per multiplexer poll.
const EVENT_CAPACITY: usize = 256;

/// Readiness interest mask for a handle wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// Interest in read readiness.
    pub const READABLE: Interest = Interest(0b001);
    /// Interest in write readiness.
    pub const WRITABLE: Interest = Interest(0b010);
    /// Interest in priority/exceptional conditions.
    pub const PRIORITY: Interest = Interest(0b100);

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub fn is_priority(self) -> bool {
        self.0 & Self::PRIORITY.0 != 0
    }

    fn to_mio(self) -> Option<mio::Interest> {
        let mut interest: Option<mio::Interest> = None;
        if self.is_readable() {
            interest = Some(mio::Interest::READABLE);
        }
        if self.is_writable() {
            interest = Some(match interest {
                Some(i) => i.add(mio::Interest::WRITABLE),
                None => mio::Interest::WRITABLE,
            });
        }
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        if self.is_priority() {
            interest = Some(match interest {
                Some(i) => i.add(mio::Interest::PRIORITY),
                None => mio::Interest::PRIORITY,
            });
        }
        interest
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// The readiness observed on a handle when its wait resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness(u8);

impl Readiness {
    const READABLE: u8 = 0b00001;
    const WRITABLE: u8 = 0b00010;
    const PRIORITY: u8 = 0b00100;
    const ERROR: u8 = 0b01000;
    const CLOSED: u8 = 0b10000;

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE != 0
    }

    pub fn is_priority(self) -> bool {
        self.0 & Self::PRIORITY != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR != 0
    }

    /// The peer hung up or the handle was closed in at least one direction.
    pub fn is_closed(self) -> bool {
        self.0 & Self::CLOSED != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn merge(self, other: Readiness) -> Readiness {
        Readiness(self.0 | other.0)
    }

    fn from_event(event: &mio::event::Event) -> Readiness {
        let mut bits = 0;
        if event.is_readable() {
            bits |= Self::READABLE;
        }
        if event.is_writable() {
            bits |= Self::WRITABLE;
        }
        if event.is_priority() {
            bits |= Self::PRIORITY;
        }
        if event.is_error() {
            bits |= Self::ERROR;
        }
        if event.is_read_closed() || event.is_write_closed() {
            bits |= Self::CLOSED;
        }
        Readiness(bits)
    }
}

/// Who gets notified when a registered handle becomes ready.
#[derive(Clone)]
pub(crate) enum IoWakee {
    /// Resume this task with the resolved mask.
    Task(TaskKey),
    /// Raise this flag (used by `select` handle subscriptions).
    Flag(Flag),
}

pub(crate) struct IoEntry {
    pub(crate) fd: RawFd,
    pub(crate) wakee: IoWakee,
    pub(crate) resolved: Option<Readiness>,
}

/// The multiplexer and its wait entries.
pub(crate) struct IoRegistry {
    poll: mio::Poll,
    events: mio::Events,
    entries: SlotMap<IoKey, IoEntry>,
    by_fd: HashMap<RawFd, IoKey>,
    waker: Arc<mio::Waker>,
}

impl IoRegistry {
    pub(crate) fn new() -> std::io::Result<Self> {
        let poll = mio::Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(IoRegistry {
            poll,
            events: mio::Events::with_capacity(EVENT_CAPACITY),
            entries: SlotMap::with_key(),
            by_fd: HashMap::new(),
            waker,
        })
    }

    pub(crate) fn waker(&self) -> Arc<mio::Waker> {
        self.waker.clone()
    }

    /// Register interest on a raw fd. Fails with `AlreadyWaiting` when the fd
    /// already has a wait entry.
    pub(crate) fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        wakee: IoWakee,
    ) -> Result<IoKey> {
        if self.by_fd.contains_key(&fd) {
            return Err(RuntimeError::AlreadyWaiting);
        }
        let mio_interest = interest
            .to_mio()
            .ok_or_else(|| RuntimeError::usage("interest mask must not be empty"))?;
        let key = self.entries.insert(IoEntry {
            fd,
            wakee,
            resolved: None,
        });
        let token = Token(key.data().as_ffi() as usize);
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), token, mio_interest)
        {
            self.entries.remove(key);
            return Err(RuntimeError::Io(format!(
                "cannot register fd {} with the multiplexer: {}",
                fd, e
            )));
        }
        self.by_fd.insert(fd, key);
        Ok(key)
    }

    /// Drop a wait entry and deregister its fd.
    pub(crate) fn remove(&mut self, key: IoKey) -> Option<IoEntry> {
        let entry = self.entries.remove(key)?;
        self.by_fd.remove(&entry.fd);
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&entry.fd)) {
            warn!(fd = entry.fd, error = %e, "failed to deregister fd");
        }
        Some(entry)
    }

    pub(crate) fn resolved(&self, key: IoKey) -> Option<Readiness> {
        self.entries.get(key).and_then(|e| e.resolved)
    }

    pub(crate) fn wakee(&self, key: IoKey) -> Option<IoWakee> {
        self.entries.get(key).map(|e| e.wakee.clone())
    }

    pub(crate) fn contains_fd(&self, fd: RawFd) -> bool {
        self.by_fd.contains_key(&fd)
    }

    /// Poll the multiplexer for up to `timeout`, record resolved masks, and
    /// return the hit entries in the order the poller reported them.
    pub(crate) fn poll_events(&mut self, timeout: Duration) -> Vec<(IoKey, Readiness)> {
        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() != std::io::ErrorKind::Interrupted {
                warn!(error = %e, "multiplexer poll failed");
            }
            return Vec::new();
        }
        let mut hits = Vec::new();
        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let key = IoKey::from(KeyData::from_ffi(event.token().0 as u64));
            let readiness = Readiness::from_event(event);
            if let Some(entry) = self.entries.get_mut(key) {
                entry.resolved = Some(entry.resolved.unwrap_or_default().merge(readiness));
                hits.push((key, readiness));
            }
        }
        hits
    }
}

/// Suspend until `handle` reports readiness for `interest`, returning the
/// resolved mask. At most one task may wait on a handle at a time; a second
/// registration fails with [`RuntimeError::AlreadyWaiting`].
pub async fn stream<H: AsRawFd>(
    handle: &H,
    interest: Interest,
    timeout: Option<Duration>,
) -> Result<Readiness> {
    IoWait {
        fd: handle.as_raw_fd(),
        interest,
        timeout,
        registered: false,
        task: None,
    }
    .await
}

/// Wait for read readiness on `handle`.
pub async fn readable<H: AsRawFd>(handle: &H, timeout: Option<Duration>) -> Result<Readiness> {
    stream(handle, Interest::READABLE, timeout).await
}

/// Wait for write readiness on `handle`.
pub async fn writable<H: AsRawFd>(handle: &H, timeout: Option<Duration>) -> Result<Readiness> {
    stream(handle, Interest::WRITABLE, timeout).await
}

struct IoWait {
    fd: RawFd,
    interest: Interest,
    timeout: Option<Duration>,
    registered: bool,
    task: Option<TaskKey>,
}

impl Future for IoWait {
    type Output = Result<Readiness>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let step = runtime::with_driver(|d| {
            let me = match d.current_task() {
                Some(k) => k,
                None => {
                    return Poll::Ready(Err(RuntimeError::usage(
                        "stream wait requires a running task",
                    )))
                }
            };
            if let Some(err) = d.take_planned(me) {
                return Poll::Ready(Err(err));
            }
            if !this.registered {
                let key = match d.register_io(this.fd, this.interest, IoWakee::Task(me)) {
                    Ok(key) => key,
                    Err(e) => return Poll::Ready(Err(e)),
                };
                this.registered = true;
                this.task = Some(me);
                let deadline = d.resolve_deadline(Deadline::Default(this.timeout));
                d.park_on_io(me, key, deadline);
                Poll::Pending
            } else if d.task_is_running(me) {
                let mask = d.take_io_result(me).unwrap_or_default();
                Poll::Ready(Ok(mask))
            } else {
                Poll::Pending
            }
        });
        match step {
            Ok(poll) => poll,
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl Drop for IoWait {
    fn drop(&mut self) {
        if !self.registered {
            return;
        }
        if let Some(task) = self.task {
            let _ = runtime::with_driver(|d| d.abandon_wait(task));
        }
    }
}

/// Put a raw fd into non-blocking mode.
fn set_nonblocking(fd: RawFd) -> Result<()> {
    // fcntl is the only portable way to flip O_NONBLOCK on an arbitrary fd
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Wrap a handle in a non-blocking façade for use inside the runtime.
///
/// Equivalent to [`Async::new`].
pub fn wrap<T: AsRawFd>(inner: T) -> Result<Async<T>> {
    Async::new(inner)
}

/// A non-blocking façade over an fd-backed handle.
///
/// Ordinary `read`/`write` calls are retried after a readiness wait whenever
/// the underlying handle reports `WouldBlock`, so higher layers can intersperse
/// them freely with explicit [`stream`] waits.
#[derive(Debug)]
pub struct Async<T: AsRawFd> {
    inner: T,
}

impl<T: AsRawFd> Async<T> {
    /// Switch `inner` to non-blocking mode and wrap it.
    pub fn new(inner: T) -> Result<Self> {
        set_nonblocking(inner.as_raw_fd())?;
        Ok(Async { inner })
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Unwrap the inner handle. It is left in non-blocking mode.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Wait for read readiness on the wrapped handle.
    pub async fn readable(&self, timeout: Option<Duration>) -> Result<Readiness> {
        stream(&self.inner, Interest::READABLE, timeout).await
    }

    /// Wait for write readiness on the wrapped handle.
    pub async fn writable(&self, timeout: Option<Duration>) -> Result<Readiness> {
        stream(&self.inner, Interest::WRITABLE, timeout).await
    }
}

impl<T: AsRawFd + Read> Async<T> {
    /// Read into `buf`, suspending on readiness whenever the handle would
    /// block.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.inner.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    stream(&self.inner, Interest::READABLE, None).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl<T: AsRawFd + Write> Async<T> {
    /// Write from `buf`, suspending on readiness whenever the handle would
    /// block.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        loop {
            match self.inner.write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    stream(&self.inner, Interest::WRITABLE, None).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
