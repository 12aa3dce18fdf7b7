//! The driver: event loop tick, task table, and wait structures
//!
//! The driver owns every scheduler structure: the ready and after-next
//! queues, the timer heap, the I/O registry, the flag table, and the
//! micro-task queue. All mutation happens on the driver thread while no task
//! is running; tasks interact with it only through the suspension primitives,
//! which serialize through [`crate::runtime::with_driver`].
//!
//! One tick runs, in order: the rate-limited timeout sweep, queued
//! micro-tasks, timer extraction, sleep-budget computation (raising the idle
//! flag instead of sleeping when tasks wait for it), the I/O multiplex with
//! the budget as its timeout, and finally a snapshot-bounded drain of the
//! ready queue. Tasks enqueued while the drain runs never run in the same
//! snapshot, and tasks that yielded are promoted only at tick end.

use crate::config::RuntimeConfig;
use crate::defaults::TIMEOUT_SWEEP_INTERVAL_MS;
use crate::error::{Deadline, Result, RuntimeError};
use crate::flags::{Flag, FlagTable};
use crate::io::{IoKey, IoRegistry, IoWakee, Interest, Readiness};
use crate::scope::{ScopeEntry, ScopeKey};
use crate::timer::TimerHeap;
use futures_util::task::ArcWake;
use slotmap::{Key, KeyData, SlotMap};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

slotmap::new_key_type! {
    pub(crate) struct TaskKey;
}

/// Where a waiting task is parked. A task is in at most one structure at a
/// time; the variant tells timeout and cancellation where to evict it from.
#[derive(Clone)]
pub(crate) enum Parked {
    /// In the timer heap (the heap entry is skipped if it goes stale).
    Timer,
    /// In the I/O registry under this entry key.
    Io(IoKey),
    /// In the waiter list of this flag id.
    Flag(u64),
    /// In a shared wait list (channel readers/writers).
    List(Rc<RefCell<WaitList>>),
    /// Suspended on a foreign future; only its waker can resume it.
    External,
}

pub(crate) enum TaskState {
    /// Queued in the ready or after-next queue.
    Runnable,
    /// Being polled right now.
    Running,
    /// Parked in a wait structure, with an optional deadline for the sweep.
    Waiting {
        parked: Parked,
        deadline: Option<Instant>,
    },
    Terminated,
}

/// FIFO list of parked tasks, shared between the driver and a channel.
#[derive(Default)]
pub(crate) struct WaitList {
    waiters: VecDeque<TaskKey>,
}

impl WaitList {
    pub(crate) fn push_back(&mut self, task: TaskKey) {
        self.waiters.push_back(task);
    }

    pub(crate) fn pop_front(&mut self) -> Option<TaskKey> {
        self.waiters.pop_front()
    }

    pub(crate) fn remove(&mut self, task: TaskKey) {
        self.waiters.retain(|t| *t != task);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub(crate) fn drain(&mut self) -> VecDeque<TaskKey> {
        std::mem::take(&mut self.waiters)
    }
}

pub(crate) struct TaskEntry {
    future: Option<Pin<Box<dyn Future<Output = ()>>>>,
    pub(crate) state: TaskState,
    parent: Option<TaskKey>,
    scope: ScopeKey,
    planned: Option<RuntimeError>,
    failure: Option<RuntimeError>,
    abandoned: bool,
    deferred: Vec<Box<dyn FnOnce()>>,
    done_flag: Option<Flag>,
    select_notify: Vec<Flag>,
    awaiting: Option<TaskKey>,
    waker: Option<Waker>,
    io_result: Option<Readiness>,
}

struct MicroTask {
    task: Option<TaskKey>,
    run: Box<dyn FnOnce()>,
}

/// Cross-thread wake-up queue. Foreign wakers push task keys here and kick
/// the multiplexer out of its sleep.
pub(crate) struct Injected {
    pending: Mutex<Vec<u64>>,
    waker: Arc<mio::Waker>,
}

struct TaskWaker {
    key: u64,
    injected: Arc<Injected>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let mut pending = arc_self
            .injected
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        pending.push(arc_self.key);
        drop(pending);
        if let Err(e) = arc_self.injected.waker.wake() {
            warn!(error = %e, "failed to wake the multiplexer");
        }
    }
}

pub(crate) struct Driver {
    tasks: SlotMap<TaskKey, TaskEntry>,
    scopes: SlotMap<ScopeKey, ScopeEntry>,
    ready: VecDeque<TaskKey>,
    after_next: VecDeque<TaskKey>,
    timers: TimerHeap,
    pub(crate) flags: FlagTable,
    io: IoRegistry,
    micro: VecDeque<MicroTask>,
    injected: Arc<Injected>,
    default_timeout: Duration,
    preempt_interval: Duration,
    max_sleep: Duration,
    sweep_interval: Duration,
    last_sweep: Instant,
    last_preempt: Instant,
    idle_flag: Flag,
    current: Option<TaskKey>,
    live_tasks: usize,
    root_scope: ScopeKey,
    service_scope: ScopeKey,
}

impl Driver {
    pub(crate) fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let io = IoRegistry::new()
            .map_err(|e| RuntimeError::Io(format!("cannot create multiplexer: {}", e)))?;
        let injected = Arc::new(Injected {
            pending: Mutex::new(Vec::new()),
            waker: io.waker(),
        });
        let mut scopes: SlotMap<ScopeKey, ScopeEntry> = SlotMap::with_key();
        let root_scope = scopes.insert(ScopeEntry::new("root"));
        let service_scope = scopes.insert(ScopeEntry::new("service"));
        let now = Instant::now();
        Ok(Driver {
            tasks: SlotMap::with_key(),
            scopes,
            ready: VecDeque::new(),
            after_next: VecDeque::new(),
            timers: TimerHeap::default(),
            flags: FlagTable::default(),
            io,
            micro: VecDeque::new(),
            injected,
            default_timeout: config.default_timeout(),
            preempt_interval: config.preempt_interval(),
            max_sleep: config.max_sleep(),
            sweep_interval: Duration::from_millis(TIMEOUT_SWEEP_INTERVAL_MS),
            last_sweep: now,
            last_preempt: now,
            idle_flag: Flag::new(),
            current: None,
            live_tasks: 0,
            root_scope,
            service_scope,
        })
    }

    // ---- task bookkeeping -------------------------------------------------

    pub(crate) fn current_task(&self) -> Option<TaskKey> {
        self.current
    }

    pub(crate) fn task_is_running(&self, key: TaskKey) -> bool {
        matches!(
            self.tasks.get(key).map(|e| &e.state),
            Some(TaskState::Running)
        )
    }

    pub(crate) fn take_planned(&mut self, key: TaskKey) -> Option<RuntimeError> {
        self.tasks.get_mut(key).and_then(|e| e.planned.take())
    }

    pub(crate) fn take_io_result(&mut self, key: TaskKey) -> Option<Readiness> {
        self.tasks.get_mut(key).and_then(|e| e.io_result.take())
    }

    pub(crate) fn task_scope(&self, key: TaskKey) -> Option<ScopeKey> {
        self.tasks.get(key).map(|e| e.scope)
    }

    pub(crate) fn live_tasks(&self) -> usize {
        self.live_tasks
    }

    /// Register a new task in a scope. The caller starts it with
    /// [`poll_task`]; registration alone does not enqueue it.
    pub(crate) fn register_task(
        &mut self,
        scope: ScopeKey,
        parent: Option<TaskKey>,
        future: Pin<Box<dyn Future<Output = ()>>>,
    ) -> Result<TaskKey> {
        if !self.scopes.contains_key(scope) {
            return Err(RuntimeError::usage("task scope no longer exists"));
        }
        let key = self.tasks.insert(TaskEntry {
            future: Some(future),
            state: TaskState::Runnable,
            parent,
            scope,
            planned: None,
            failure: None,
            abandoned: false,
            deferred: Vec::new(),
            done_flag: None,
            select_notify: Vec::new(),
            awaiting: None,
            waker: None,
            io_result: None,
        });
        let waker = futures_util::task::waker(Arc::new(TaskWaker {
            key: key.data().as_ffi(),
            injected: self.injected.clone(),
        }));
        self.tasks[key].waker = Some(waker);
        self.scopes[scope].tasks.insert(key);
        self.live_tasks += 1;
        debug!(task = ?key, parent = ?parent, "task spawned");
        Ok(key)
    }

    pub(crate) fn record_failure_current(&mut self, err: RuntimeError) {
        if let Some(key) = self.current {
            if let Some(entry) = self.tasks.get_mut(key) {
                entry.failure = Some(err);
            }
        }
    }

    pub(crate) fn defer_current(&mut self, f: Box<dyn FnOnce()>) -> Result<()> {
        let key = self
            .current
            .ok_or_else(|| RuntimeError::usage("defer requires a running task"))?;
        if let Some(entry) = self.tasks.get_mut(key) {
            entry.deferred.push(f);
        }
        Ok(())
    }

    /// Resolve the completion flag for a join and record the awaiter edge,
    /// rejecting waits that would close an await cycle.
    pub(crate) fn prepare_join(&mut self, target: TaskKey) -> Result<Flag> {
        let me = self
            .current
            .ok_or_else(|| RuntimeError::usage("join requires a running task"))?;
        let mut cursor = Some(target);
        while let Some(key) = cursor {
            if key == me {
                return Err(RuntimeError::CyclicAwait);
            }
            cursor = self.tasks.get(key).and_then(|e| e.awaiting);
        }
        let flag = match self.tasks.get_mut(target) {
            Some(entry) => entry.done_flag.get_or_insert_with(Flag::new).clone(),
            None => return Err(RuntimeError::usage("joined task no longer exists")),
        };
        if let Some(entry) = self.tasks.get_mut(me) {
            entry.awaiting = Some(target);
        }
        Ok(flag)
    }

    pub(crate) fn clear_awaiting(&mut self) {
        if let Some(key) = self.current {
            if let Some(entry) = self.tasks.get_mut(key) {
                entry.awaiting = None;
            }
        }
    }

    /// Collect a terminated task whose result has been claimed.
    pub(crate) fn claim(&mut self, key: TaskKey) {
        if matches!(
            self.tasks.get(key).map(|e| &e.state),
            Some(TaskState::Terminated)
        ) {
            self.tasks.remove(key);
        }
    }

    /// The join handle was dropped. A live task keeps running detached; a
    /// terminated one is collected, escalating an unclaimed failure.
    pub(crate) fn abandon_handle(&mut self, key: TaskKey) {
        let terminated = match self.tasks.get_mut(key) {
            Some(entry) => match entry.state {
                TaskState::Terminated => true,
                _ => {
                    entry.abandoned = true;
                    false
                }
            },
            None => return,
        };
        if terminated {
            let failure = self.tasks.get_mut(key).and_then(|e| e.failure.take());
            if let Some(err) = failure {
                self.escalate(key, err);
            }
            self.tasks.remove(key);
        }
    }

    pub(crate) fn add_task_notify(&mut self, key: TaskKey, flag: &Flag) {
        if let Some(entry) = self.tasks.get_mut(key) {
            entry.select_notify.push(flag.clone());
        }
    }

    pub(crate) fn remove_task_notify(&mut self, key: TaskKey, flag: &Flag) {
        if let Some(entry) = self.tasks.get_mut(key) {
            entry.select_notify.retain(|f| f != flag);
        }
    }

    // ---- deadlines and parking -------------------------------------------

    pub(crate) fn resolve_deadline(&self, deadline: Deadline) -> Option<Instant> {
        match deadline {
            Deadline::Default(timeout) => {
                Some(Instant::now() + timeout.unwrap_or(self.default_timeout))
            }
            Deadline::At(at) => Some(at),
            Deadline::Never => None,
        }
    }

    /// Absolute deadline for an operation-level timeout (`select`).
    pub(crate) fn deadline_after(&self, timeout: Option<Duration>) -> Instant {
        Instant::now() + timeout.unwrap_or(self.default_timeout)
    }

    pub(crate) fn park_on_timer(&mut self, key: TaskKey, at: Instant) {
        self.timers.insert(at, key);
        if let Some(entry) = self.tasks.get_mut(key) {
            // the timer itself is the deadline; the sweep must not also fire
            entry.state = TaskState::Waiting {
                parked: Parked::Timer,
                deadline: None,
            };
        }
    }

    pub(crate) fn park_on_ready(&mut self, key: TaskKey, after_next: bool) {
        if let Some(entry) = self.tasks.get_mut(key) {
            entry.state = TaskState::Runnable;
        }
        if after_next {
            self.after_next.push_back(key);
        } else {
            self.ready.push_back(key);
        }
    }

    pub(crate) fn park_on_flag(&mut self, key: TaskKey, flag: &Flag, deadline: Option<Instant>) {
        self.flags.push_waiter(flag, key);
        if let Some(entry) = self.tasks.get_mut(key) {
            entry.state = TaskState::Waiting {
                parked: Parked::Flag(flag.id()),
                deadline,
            };
        }
    }

    pub(crate) fn park_on_io(&mut self, key: TaskKey, io_key: IoKey, deadline: Option<Instant>) {
        if let Some(entry) = self.tasks.get_mut(key) {
            entry.state = TaskState::Waiting {
                parked: Parked::Io(io_key),
                deadline,
            };
        }
    }

    /// Park in a channel wait list. The caller has already appended the task
    /// to the list; this records where it is parked.
    pub(crate) fn park_on_list(
        &mut self,
        key: TaskKey,
        list: Rc<RefCell<WaitList>>,
        deadline: Option<Instant>,
    ) {
        if let Some(entry) = self.tasks.get_mut(key) {
            entry.state = TaskState::Waiting {
                parked: Parked::List(list),
                deadline,
            };
        }
    }

    /// A primitive future was dropped while its task was parked: evict the
    /// task from the wait structure without enqueueing it.
    pub(crate) fn abandon_wait(&mut self, key: TaskKey) {
        let parked = match self.tasks.get_mut(key) {
            Some(entry) => match &entry.state {
                TaskState::Waiting { .. } => {
                    match std::mem::replace(&mut entry.state, TaskState::Running) {
                        TaskState::Waiting { parked, .. } => Some(parked),
                        _ => None,
                    }
                }
                _ => None,
            },
            None => None,
        };
        if let Some(parked) = parked {
            self.evict_structure(parked, key);
        }
    }

    fn evict_structure(&mut self, parked: Parked, key: TaskKey) {
        match parked {
            Parked::Timer => {} // the heap entry goes stale and is skipped
            Parked::Io(io_key) => {
                self.io.remove(io_key);
            }
            Parked::Flag(flag_id) => {
                self.flags.remove_waiter(flag_id, key);
            }
            Parked::List(list) => {
                list.borrow_mut().remove(key);
            }
            Parked::External => {}
        }
    }

    // ---- waking -----------------------------------------------------------

    /// Resume a task whose wait structure entry has already been removed.
    pub(crate) fn wake_parked(&mut self, key: TaskKey) {
        self.wake_parked_with(key, None);
    }

    fn wake_parked_with(&mut self, key: TaskKey, planned: Option<RuntimeError>) {
        if let Some(entry) = self.tasks.get_mut(key) {
            if matches!(entry.state, TaskState::Waiting { .. }) {
                entry.state = TaskState::Runnable;
                if entry.planned.is_none() {
                    entry.planned = planned;
                }
                self.ready.push_back(key);
            }
        }
    }

    /// Evict a waiting task from its structure and enqueue it, optionally
    /// planting an error to be thrown at its suspension site.
    fn evict_and_wake(&mut self, key: TaskKey, planned: Option<RuntimeError>) {
        let parked = match self.tasks.get_mut(key) {
            Some(entry) => match std::mem::replace(&mut entry.state, TaskState::Runnable) {
                TaskState::Waiting { parked, .. } => Some(parked),
                other => {
                    entry.state = other;
                    None
                }
            },
            None => None,
        };
        let Some(parked) = parked else { return };
        self.evict_structure(parked, key);
        if let Some(entry) = self.tasks.get_mut(key) {
            if entry.planned.is_none() {
                entry.planned = planned;
            }
        }
        self.ready.push_back(key);
    }

    /// Cancel a suspended task by planting `err` and enqueueing it.
    ///
    /// Only tasks parked in a runtime wait structure can be cancelled; a
    /// running, queued, terminated, or externally-suspended task reports
    /// `NotBlocked`.
    pub(crate) fn cancel_task(&mut self, key: TaskKey, err: RuntimeError) -> Result<()> {
        let cancellable = matches!(
            self.tasks.get(key).map(|e| &e.state),
            Some(TaskState::Waiting { parked, .. }) if !matches!(parked, Parked::External)
        );
        if !cancellable {
            return Err(RuntimeError::NotBlocked);
        }
        debug!(task = ?key, error = %err, "cancelling task");
        self.evict_and_wake(key, Some(err));
        Ok(())
    }

    pub(crate) fn raise_flag_internal(&mut self, flag: &Flag) -> usize {
        let waiters = self.flags.drain_waiters(flag.id());
        let count = waiters.len();
        for task in waiters {
            self.wake_parked(task);
        }
        if count > 0 {
            trace!(flag = flag.id(), count, "flag raised");
        }
        count
    }

    pub(crate) fn idle_flag(&self) -> Flag {
        self.idle_flag.clone()
    }

    pub(crate) fn preempt_due(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_preempt) >= self.preempt_interval {
            self.last_preempt = now;
            true
        } else {
            false
        }
    }

    // ---- I/O --------------------------------------------------------------

    pub(crate) fn register_io(
        &mut self,
        fd: RawFd,
        interest: Interest,
        wakee: IoWakee,
    ) -> Result<IoKey> {
        self.io.register(fd, interest, wakee)
    }

    pub(crate) fn remove_io(&mut self, key: IoKey) {
        self.io.remove(key);
    }

    pub(crate) fn io_resolved(&self, key: IoKey) -> Option<Readiness> {
        self.io.resolved(key)
    }

    /// Whether any task or selector currently waits on `fd`.
    #[allow(dead_code)] // exercised by the test suite
    pub(crate) fn io_waiting_on(&self, fd: RawFd) -> bool {
        self.io.contains_fd(fd)
    }

    // ---- scopes -----------------------------------------------------------

    pub(crate) fn create_scope(&mut self, label: &'static str) -> ScopeKey {
        self.scopes.insert(ScopeEntry::new(label))
    }

    pub(crate) fn root_scope(&self) -> ScopeKey {
        self.root_scope
    }

    pub(crate) fn service_scope(&self) -> ScopeKey {
        self.service_scope
    }

    pub(crate) fn scope_is_drained(&self, key: ScopeKey) -> bool {
        self.scopes.get(key).map(|s| s.tasks.is_empty()).unwrap_or(true)
    }

    pub(crate) fn scope_drain_flag(&self, key: ScopeKey) -> Result<Flag> {
        self.scopes
            .get(key)
            .map(|s| s.drain_flag.clone())
            .ok_or_else(|| RuntimeError::usage("scope no longer exists"))
    }

    pub(crate) fn take_scope_error(&mut self, key: ScopeKey) -> Option<RuntimeError> {
        self.scopes.get_mut(key).and_then(|s| s.error.take())
    }

    pub(crate) fn remove_scope(&mut self, key: ScopeKey) {
        if key == self.root_scope || key == self.service_scope {
            return;
        }
        self.scopes.remove(key);
    }

    // ---- termination and escalation ---------------------------------------

    fn terminate(&mut self, key: TaskKey) {
        let (deferred, done_flag, notify, scope, abandoned, failure) = {
            let Some(entry) = self.tasks.get_mut(key) else {
                return;
            };
            entry.state = TaskState::Terminated;
            let deferred: Vec<Box<dyn FnOnce()>> = entry.deferred.drain(..).collect();
            let done_flag = entry.done_flag.clone();
            let notify: Vec<Flag> = entry.select_notify.drain(..).collect();
            let abandoned = entry.abandoned;
            let failure = if abandoned { entry.failure.take() } else { None };
            (deferred, done_flag, notify, entry.scope, abandoned, failure)
        };
        self.live_tasks = self.live_tasks.saturating_sub(1);

        // deferred closures run as micro-tasks, in reverse insertion order
        for f in deferred.into_iter().rev() {
            self.micro.push_back(MicroTask {
                task: Some(key),
                run: f,
            });
        }
        if let Some(flag) = done_flag {
            self.raise_flag_internal(&flag);
        }
        for flag in &notify {
            self.raise_flag_internal(flag);
        }
        if let Some(scope_entry) = self.scopes.get_mut(scope) {
            scope_entry.tasks.remove(&key);
            if scope_entry.tasks.is_empty() {
                let drain = scope_entry.drain_flag.clone();
                trace!(scope = scope_entry.label, "scope drained");
                self.raise_flag_internal(&drain);
            }
        }
        debug!(task = ?key, "task terminated");
        if abandoned {
            if let Some(err) = failure {
                self.escalate(key, err);
            }
            self.tasks.remove(key);
        }
    }

    /// Hand an unclaimed task error to the nearest still-live ancestor as a
    /// planned error, falling back to the task's scope aggregate.
    fn escalate(&mut self, from: TaskKey, err: RuntimeError) {
        enum Delivery {
            Missing,
            Dead(Option<TaskKey>),
            Evict,
            Plan,
        }
        let mut cursor = self.tasks.get(from).and_then(|e| e.parent);
        while let Some(key) = cursor {
            let delivery = match self.tasks.get(key) {
                None => Delivery::Missing,
                Some(entry) => match &entry.state {
                    TaskState::Terminated => Delivery::Dead(entry.parent),
                    TaskState::Waiting { parked, .. } if !matches!(parked, Parked::External) => {
                        Delivery::Evict
                    }
                    _ => Delivery::Plan,
                },
            };
            match delivery {
                Delivery::Missing => break,
                Delivery::Dead(parent) => cursor = parent,
                Delivery::Evict => {
                    debug!(task = ?from, ancestor = ?key, error = %err, "escalating unclaimed task error");
                    self.evict_and_wake(key, Some(err));
                    return;
                }
                Delivery::Plan => {
                    debug!(task = ?from, ancestor = ?key, error = %err, "escalating unclaimed task error");
                    if let Some(entry) = self.tasks.get_mut(key) {
                        if entry.planned.is_none() {
                            entry.planned = Some(err);
                        }
                    }
                    return;
                }
            }
        }
        let scope = self.tasks.get(from).map(|e| e.scope);
        if let Some(scope_key) = scope {
            if let Some(scope_entry) = self.scopes.get_mut(scope_key) {
                if scope_entry.error.is_none() {
                    debug!(task = ?from, error = %err, "recording unclaimed error on scope");
                    scope_entry.error = Some(err);
                    return;
                }
            }
        }
        error!(task = ?from, error = %err, "unhandled task error dropped");
    }

    // ---- tick internals ---------------------------------------------------

    fn sweep_timeouts(&mut self, now: Instant) {
        let due: Vec<TaskKey> = self
            .tasks
            .iter()
            .filter_map(|(key, entry)| match &entry.state {
                TaskState::Waiting {
                    deadline: Some(d), ..
                } if *d <= now => Some(key),
                _ => None,
            })
            .collect();
        for key in due {
            trace!(task = ?key, "wait deadline elapsed");
            self.evict_and_wake(key, Some(RuntimeError::Timeout));
        }
    }

    fn sweep_dead_flags(&mut self) {
        for (flag_id, waiters) in self.flags.take_dead() {
            for task in waiters {
                warn!(task = ?task, flag = flag_id, "flag source dropped while awaited");
                // the flag entry is already gone; only the state needs fixing
                if let Some(entry) = self.tasks.get_mut(task) {
                    if matches!(entry.state, TaskState::Waiting { .. }) {
                        entry.state = TaskState::Runnable;
                        if entry.planned.is_none() {
                            entry.planned = Some(RuntimeError::FlagSourceGone);
                        }
                        self.ready.push_back(task);
                    }
                }
            }
        }
    }

    fn sleep_budget(&self, now: Instant) -> Duration {
        if !self.ready.is_empty() || !self.micro.is_empty() {
            return Duration::ZERO;
        }
        let mut budget = self.max_sleep;
        if let Some(at) = self.timers.next_deadline() {
            budget = budget.min(at.saturating_duration_since(now));
        }
        // deadline waiters are resumed by the sweep, so never sleep past the
        // next permitted sweep while any exist
        let earliest = self
            .tasks
            .values()
            .filter_map(|entry| match &entry.state {
                TaskState::Waiting {
                    deadline: Some(d), ..
                } => Some(*d),
                _ => None,
            })
            .min();
        if let Some(deadline) = earliest {
            let wake_at = deadline.max(self.last_sweep + self.sweep_interval);
            budget = budget.min(wake_at.saturating_duration_since(now));
        }
        budget
    }

    fn dispatch_io(&mut self, budget: Duration) {
        let hits = self.io.poll_events(budget);
        for (key, _) in hits {
            match self.io.wakee(key) {
                Some(IoWakee::Task(task)) => {
                    if let Some(entry) = self.io.remove(key) {
                        if let Some(task_entry) = self.tasks.get_mut(task) {
                            task_entry.io_result = entry.resolved;
                        }
                    }
                    self.wake_parked(task);
                }
                Some(IoWakee::Flag(flag)) => {
                    // the entry stays registered; select re-checks readiness
                    self.raise_flag_internal(&flag);
                }
                None => {}
            }
        }
    }

    fn drain_injected(&mut self) {
        let pending: Vec<u64> = {
            let mut guard = self
                .injected
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for raw in pending {
            let key = TaskKey::from(KeyData::from_ffi(raw));
            if let Some(entry) = self.tasks.get_mut(key) {
                if matches!(
                    entry.state,
                    TaskState::Waiting {
                        parked: Parked::External,
                        ..
                    }
                ) {
                    entry.state = TaskState::Runnable;
                    self.ready.push_back(key);
                }
            }
        }
    }

    fn pop_ready(&mut self) -> Option<TaskKey> {
        self.ready.pop_front()
    }

    fn ready_len(&self) -> usize {
        self.ready.len()
    }

    fn promote_after_next(&mut self) {
        while let Some(task) = self.after_next.pop_front() {
            self.ready.push_back(task);
        }
    }
}

/// Run one driver tick.
pub(crate) fn tick(rt: &Rc<RefCell<Driver>>) {
    let now = Instant::now();
    {
        let mut d = rt.borrow_mut();
        if now.duration_since(d.last_sweep) >= d.sweep_interval {
            d.last_sweep = now;
            d.sweep_timeouts(now);
            d.sweep_dead_flags();
        }
    }

    run_micro(rt);

    if rt.borrow().live_tasks == 0 {
        return;
    }

    {
        let mut d = rt.borrow_mut();
        let now = Instant::now();
        while let Some(task) = d.timers.pop_due(now) {
            // stale heap entries for tasks no longer timer-parked are skipped
            let still_sleeping = matches!(
                d.tasks.get(task).map(|e| &e.state),
                Some(TaskState::Waiting {
                    parked: Parked::Timer,
                    ..
                })
            );
            if still_sleeping {
                d.wake_parked(task);
            }
        }

        let mut budget = d.sleep_budget(now);
        if budget > Duration::ZERO && d.flags.has_waiters(d.idle_flag.id()) {
            let idle = d.idle_flag.clone();
            trace!("raising idle flag instead of sleeping");
            d.raise_flag_internal(&idle);
            budget = Duration::ZERO;
        }

        d.dispatch_io(budget);
        d.drain_injected();
    }

    // snapshot so tasks enqueued during the drain wait for the next tick
    let snapshot = rt.borrow().ready_len();
    for _ in 0..snapshot {
        let next = rt.borrow_mut().pop_ready();
        let Some(key) = next else { break };
        poll_task(rt, key);
        run_micro(rt);
    }

    rt.borrow_mut().promote_after_next();
}

/// Run the currently queued micro-tasks exactly once.
pub(crate) fn run_micro(rt: &Rc<RefCell<Driver>>) {
    let queued = rt.borrow().micro.len();
    for _ in 0..queued {
        let next = rt.borrow_mut().micro.pop_front();
        let Some(micro) = next else { break };
        trace!(task = ?micro.task, "running micro-task");
        (micro.run)();
    }
}

/// Poll one task to its next suspension point or completion.
pub(crate) fn poll_task(rt: &Rc<RefCell<Driver>>, key: TaskKey) {
    let polled = {
        let mut d = rt.borrow_mut();
        let Some(entry) = d.tasks.get_mut(key) else {
            return;
        };
        if matches!(entry.state, TaskState::Terminated) {
            return;
        }
        entry.state = TaskState::Running;
        let Some(future) = entry.future.take() else {
            return;
        };
        let Some(waker) = entry.waker.clone() else {
            return;
        };
        let prev = d.current.replace(key);
        (future, waker, prev)
    };
    let (mut future, waker, prev) = polled;

    let mut cx = Context::from_waker(&waker);
    let poll = future.as_mut().poll(&mut cx);

    let mut d = rt.borrow_mut();
    d.current = prev;
    match poll {
        Poll::Ready(()) => d.terminate(key),
        Poll::Pending => {
            if let Some(entry) = d.tasks.get_mut(key) {
                entry.future = Some(future);
                if matches!(entry.state, TaskState::Running) {
                    // no runtime primitive parked the task: it waits on a
                    // foreign future and only its waker can resume it
                    entry.state = TaskState::Waiting {
                        parked: Parked::External,
                        deadline: None,
                    };
                }
            }
        }
    }
}
