//! Channels: FIFO pipes between tasks
//!
//! A channel with capacity N ≥ 1 buffers up to N values; writers park when
//! the buffer is full and readers park when it is empty. A channel with
//! capacity 0 is a rendezvous: a writer hands its value directly to a parked
//! reader (and vice versa a reader meeting a parked writer resumes it and
//! parks until the value arrives).
//!
//! Fairness is strict FIFO on both sides: a newly arriving reader or writer
//! never overtakes one that is parked, or one that has been woken but not
//! yet run. Closing is idempotent; parked writers fail with `ChannelClosed`
//! and readers drain the buffer before observing end-of-stream.
//!
//! The task that created a channel may not block on it while no other task
//! is engaged with it; that would suspend the only task able to complete the
//! operation. The guard is a one-shot check at the first blocking attempt
//! and clears permanently once any other task touches the channel.

use crate::driver::{Driver, TaskKey, WaitList};
use crate::error::{Deadline, Result, RuntimeError};
use crate::flags::Flag;
use crate::runtime;
use crate::select::Selectable;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

struct Core<T> {
    capacity: usize,
    buffer: VecDeque<T>,
    closed: bool,
    /// Rendezvous deliveries addressed to a specific parked reader.
    handoffs: VecDeque<(TaskKey, T)>,
    readers: Rc<RefCell<WaitList>>,
    writers: Rc<RefCell<WaitList>>,
    /// Waiters already resumed by the channel but not yet run; they keep
    /// their FIFO position ahead of fresh arrivals.
    woken_readers: Vec<TaskKey>,
    woken_writers: Vec<TaskKey>,
    creator: Option<TaskKey>,
    guard_cleared: bool,
    /// Flags subscribed by `select`, raised on every state change.
    notify: Vec<Flag>,
    senders: usize,
    receivers: usize,
}

impl<T> Core<T> {
    fn take_woken_reader(&mut self, task: TaskKey) -> bool {
        match self.woken_readers.iter().position(|t| *t == task) {
            Some(pos) => {
                self.woken_readers.remove(pos);
                true
            }
            None => false,
        }
    }

    fn take_woken_writer(&mut self, task: TaskKey) -> bool {
        match self.woken_writers.iter().position(|t| *t == task) {
            Some(pos) => {
                self.woken_writers.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Whether any task is currently engaged with the channel (the creator
    /// guard only fires while nothing else could make progress).
    fn nothing_blocked(&self) -> bool {
        self.readers.borrow().is_empty()
            && self.writers.borrow().is_empty()
            && self.woken_readers.is_empty()
            && self.woken_writers.is_empty()
            && self.handoffs.is_empty()
    }
}

/// Create a channel pair. `capacity` 0 builds a rendezvous channel.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let creator = runtime::with_driver(|d| d.current_task())
        .ok()
        .flatten();
    let core = Rc::new(RefCell::new(Core {
        capacity,
        buffer: VecDeque::new(),
        closed: false,
        handoffs: VecDeque::new(),
        readers: Rc::new(RefCell::new(WaitList::default())),
        writers: Rc::new(RefCell::new(WaitList::default())),
        woken_readers: Vec::new(),
        woken_writers: Vec::new(),
        creator,
        guard_cleared: false,
        notify: Vec::new(),
        senders: 1,
        receivers: 1,
    }));
    (
        Sender { core: core.clone() },
        Receiver { core },
    )
}

fn close_core<T>(d: &mut Driver, core: &Rc<RefCell<Core<T>>>) {
    let (woken, notify) = {
        let mut c = core.borrow_mut();
        if c.closed {
            return;
        }
        c.closed = true;
        let writers: Vec<TaskKey> = c.writers.borrow_mut().drain().into_iter().collect();
        let readers: Vec<TaskKey> = c.readers.borrow_mut().drain().into_iter().collect();
        // woken waiters keep their FIFO entitlement so drains stay ordered
        c.woken_writers.extend(writers.iter().copied());
        c.woken_readers.extend(readers.iter().copied());
        let mut woken = writers;
        woken.extend(readers);
        (woken, c.notify.clone())
    };
    for task in woken {
        d.wake_parked(task);
    }
    for flag in &notify {
        d.raise_flag_internal(flag);
    }
}

/// The writing half of a channel.
pub struct Sender<T> {
    core: Rc<RefCell<Core<T>>>,
}

impl<T> std::fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = self.core.borrow();
        f.debug_struct("Sender")
            .field("capacity", &c.capacity)
            .field("len", &c.buffer.len())
            .field("closed", &c.closed)
            .finish()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.core.borrow_mut().senders += 1;
        Sender {
            core: self.core.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let last = {
            let mut c = self.core.borrow_mut();
            c.senders -= 1;
            c.senders == 0
        };
        if last {
            self.close();
        }
    }
}

impl<T> Sender<T> {
    /// Send a value, suspending while the channel is full (or, on a
    /// rendezvous channel, until a reader takes the value). Uses the default
    /// timeout.
    pub async fn send(&self, value: T) -> Result<()> {
        SendFut {
            core: self.core.clone(),
            value: Some(value),
            timeout: None,
            deadline: None,
            registered: false,
            task: None,
        }
        .await
    }

    /// Send with an explicit timeout.
    pub async fn send_timeout(&self, value: T, timeout: Duration) -> Result<()> {
        SendFut {
            core: self.core.clone(),
            value: Some(value),
            timeout: Some(timeout),
            deadline: None,
            registered: false,
            task: None,
        }
        .await
    }

    /// Close the channel. Idempotent; parked writers fail with
    /// `ChannelClosed` and readers drain the buffer before end-of-stream.
    pub fn close(&self) {
        if runtime::with_driver(|d| close_core(d, &self.core)).is_err() {
            // no runtime on this thread, so no waiter can exist either
            self.core.borrow_mut().closed = true;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.core.borrow().closed
    }

    pub fn len(&self) -> usize {
        self.core.borrow().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.borrow().buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.core.borrow().capacity
    }

    pub(crate) fn add_notify(&self, flag: &Flag) {
        self.core.borrow_mut().notify.push(flag.clone());
    }

    pub(crate) fn remove_notify(&self, flag: &Flag) {
        self.core.borrow_mut().notify.retain(|f| f != flag);
    }

    pub(crate) fn write_ready(&self) -> bool {
        let c = self.core.borrow();
        if c.closed {
            return true;
        }
        if c.capacity == 0 {
            !c.readers.borrow().is_empty()
        } else {
            c.buffer.len() < c.capacity
                && c.writers.borrow().is_empty()
                && c.woken_writers.is_empty()
        }
    }
}

/// The reading half of a channel.
pub struct Receiver<T> {
    core: Rc<RefCell<Core<T>>>,
}

impl<T> std::fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = self.core.borrow();
        f.debug_struct("Receiver")
            .field("capacity", &c.capacity)
            .field("len", &c.buffer.len())
            .field("closed", &c.closed)
            .finish()
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.core.borrow_mut().receivers += 1;
        Receiver {
            core: self.core.clone(),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let last = {
            let mut c = self.core.borrow_mut();
            c.receivers -= 1;
            c.receivers == 0
        };
        if last {
            // nobody can read anymore; fail parked writers
            if runtime::with_driver(|d| close_core(d, &self.core)).is_err() {
                self.core.borrow_mut().closed = true;
            }
        }
    }
}

impl<T> Receiver<T> {
    /// Receive the next value, suspending while the channel is empty. Returns
    /// `Ok(None)` at end-of-stream. Uses the default timeout.
    pub async fn recv(&self) -> Result<Option<T>> {
        RecvFut {
            core: self.core.clone(),
            timeout: None,
            deadline: None,
            registered: false,
            task: None,
        }
        .await
    }

    /// Receive with an explicit timeout.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        RecvFut {
            core: self.core.clone(),
            timeout: Some(timeout),
            deadline: None,
            registered: false,
            task: None,
        }
        .await
    }

    pub fn is_closed(&self) -> bool {
        self.core.borrow().closed
    }

    pub fn len(&self) -> usize {
        self.core.borrow().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.borrow().buffer.is_empty()
    }

    pub(crate) fn add_notify(&self, flag: &Flag) {
        self.core.borrow_mut().notify.push(flag.clone());
    }

    pub(crate) fn remove_notify(&self, flag: &Flag) {
        self.core.borrow_mut().notify.retain(|f| f != flag);
    }

    pub(crate) fn read_ready(&self) -> bool {
        let c = self.core.borrow();
        c.closed
            || !c.buffer.is_empty()
            || !c.handoffs.is_empty()
            || (c.capacity == 0 && !c.writers.borrow().is_empty())
    }
}

struct SendFut<T> {
    core: Rc<RefCell<Core<T>>>,
    value: Option<T>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    registered: bool,
    task: Option<TaskKey>,
}

impl<T> Unpin for SendFut<T> {}

impl<T> Future for SendFut<T> {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let step = runtime::with_driver(|d| send_step(d, this));
        match step {
            Ok(poll) => poll,
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

fn send_step<T>(d: &mut Driver, this: &mut SendFut<T>) -> Poll<Result<()>> {
    let me = match d.current_task() {
        Some(k) => k,
        None => {
            return Poll::Ready(Err(RuntimeError::usage(
                "channel send requires a running task",
            )))
        }
    };
    let core = this.core.clone();
    let mut c = core.borrow_mut();
    let was_woken = c.take_woken_writer(me);
    if let Some(err) = d.take_planned(me) {
        return Poll::Ready(Err(err));
    }
    if c.creator != Some(me) {
        c.guard_cleared = true;
    }
    if c.closed {
        return Poll::Ready(Err(RuntimeError::ChannelClosed));
    }

    let entitled =
        was_woken || (c.writers.borrow().is_empty() && c.woken_writers.is_empty());

    if c.capacity == 0 {
        if entitled {
            let target = c.readers.borrow_mut().pop_front();
            if let Some(reader) = target {
                let Some(value) = this.value.take() else {
                    return Poll::Ready(Err(RuntimeError::usage("value already sent")));
                };
                c.handoffs.push_back((reader, value));
                let notify = c.notify.clone();
                drop(c);
                d.wake_parked(reader);
                for flag in &notify {
                    d.raise_flag_internal(flag);
                }
                return Poll::Ready(Ok(()));
            }
        }
    } else if entitled && c.buffer.len() < c.capacity {
        let Some(value) = this.value.take() else {
            return Poll::Ready(Err(RuntimeError::usage("value already sent")));
        };
        c.buffer.push_back(value);
        let reader = c.readers.borrow_mut().pop_front();
        if let Some(r) = reader {
            c.woken_readers.push(r);
        }
        let notify = c.notify.clone();
        drop(c);
        if let Some(r) = reader {
            d.wake_parked(r);
        }
        for flag in &notify {
            d.raise_flag_internal(flag);
        }
        return Poll::Ready(Ok(()));
    }

    // the operation would block
    if !this.registered
        && c.creator == Some(me)
        && !c.guard_cleared
        && c.nothing_blocked()
    {
        return Poll::Ready(Err(RuntimeError::usage(
            "blocking on a channel from the task that created it would deadlock",
        )));
    }
    if this.deadline.is_none() {
        this.deadline = d.resolve_deadline(Deadline::Default(this.timeout));
    }
    c.writers.borrow_mut().push_back(me);
    let list = c.writers.clone();
    drop(c);
    d.park_on_list(me, list, this.deadline);
    this.registered = true;
    this.task = Some(me);
    Poll::Pending
}

impl<T> Drop for SendFut<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task {
            self.core.borrow_mut().take_woken_writer(task);
            if self.registered {
                let _ = runtime::with_driver(|d| d.abandon_wait(task));
            }
        }
    }
}

struct RecvFut<T> {
    core: Rc<RefCell<Core<T>>>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    registered: bool,
    task: Option<TaskKey>,
}

impl<T> Unpin for RecvFut<T> {}

impl<T> Future for RecvFut<T> {
    type Output = Result<Option<T>>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let step = runtime::with_driver(|d| recv_step(d, this));
        match step {
            Ok(poll) => poll,
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

fn recv_step<T>(d: &mut Driver, this: &mut RecvFut<T>) -> Poll<Result<Option<T>>> {
    let me = match d.current_task() {
        Some(k) => k,
        None => {
            return Poll::Ready(Err(RuntimeError::usage(
                "channel recv requires a running task",
            )))
        }
    };
    let core = this.core.clone();
    let mut c = core.borrow_mut();
    let was_woken = c.take_woken_reader(me);
    if let Some(err) = d.take_planned(me) {
        return Poll::Ready(Err(err));
    }
    if c.creator != Some(me) {
        c.guard_cleared = true;
    }

    // a rendezvous delivery addressed to this task wins over everything
    if let Some(pos) = c.handoffs.iter().position(|(task, _)| *task == me) {
        if let Some((_, value)) = c.handoffs.remove(pos) {
            return Poll::Ready(Ok(Some(value)));
        }
    }

    let entitled =
        was_woken || (c.readers.borrow().is_empty() && c.woken_readers.is_empty());

    if entitled && !c.buffer.is_empty() {
        let value = c.buffer.pop_front();
        let writer = c.writers.borrow_mut().pop_front();
        if let Some(w) = writer {
            c.woken_writers.push(w);
        }
        // after close no sends arrive, so readers chain the wake-ups that
        // keep the buffer draining
        let chained = if c.closed {
            let next = c.readers.borrow_mut().pop_front();
            if let Some(r) = next {
                c.woken_readers.push(r);
            }
            next
        } else {
            None
        };
        let notify = c.notify.clone();
        drop(c);
        if let Some(w) = writer {
            d.wake_parked(w);
        }
        if let Some(r) = chained {
            d.wake_parked(r);
        }
        for flag in &notify {
            d.raise_flag_internal(flag);
        }
        return Poll::Ready(Ok(value));
    }

    if c.closed && c.buffer.is_empty() {
        // every remaining parked reader observes end-of-stream as well
        let rest: Vec<TaskKey> = c.readers.borrow_mut().drain().into_iter().collect();
        c.woken_readers.extend(rest.iter().copied());
        drop(c);
        for task in rest {
            d.wake_parked(task);
        }
        return Poll::Ready(Ok(None));
    }

    // rendezvous: resume the first parked writer, then wait for its value
    if c.capacity == 0 && entitled {
        let writer = c.writers.borrow_mut().pop_front();
        if let Some(w) = writer {
            c.woken_writers.push(w);
            d.wake_parked(w);
        }
    }

    if !this.registered
        && c.creator == Some(me)
        && !c.guard_cleared
        && c.nothing_blocked()
    {
        return Poll::Ready(Err(RuntimeError::usage(
            "blocking on a channel from the task that created it would deadlock",
        )));
    }
    if this.deadline.is_none() {
        this.deadline = d.resolve_deadline(Deadline::Default(this.timeout));
    }
    c.readers.borrow_mut().push_back(me);
    let list = c.readers.clone();
    drop(c);
    d.park_on_list(me, list, this.deadline);
    this.registered = true;
    this.task = Some(me);
    Poll::Pending
}

impl<T> Drop for RecvFut<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task {
            self.core.borrow_mut().take_woken_reader(task);
            if self.registered {
                let _ = runtime::with_driver(|d| d.abandon_wait(task));
            }
        }
    }
}

impl<T> Selectable for Receiver<T> {
    fn is_ready(&self) -> bool {
        self.read_ready()
    }

    fn register(&self, flag: &Flag) -> Result<()> {
        self.add_notify(flag);
        Ok(())
    }

    fn unregister(&self, flag: &Flag) {
        self.remove_notify(flag);
    }
}

impl<T> Selectable for Sender<T> {
    fn is_ready(&self) -> bool {
        self.write_ready()
    }

    fn register(&self, flag: &Flag) -> Result<()> {
        self.add_notify(flag);
        Ok(())
    }

    fn unregister(&self, flag: &Flag) {
        self.remove_notify(flag);
    }
}
