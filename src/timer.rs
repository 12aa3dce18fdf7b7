//! Timer heap and the timing primitives: `sleep`, `yield_now`, `preempt`
//!
//! Sleeping tasks are keyed by their absolute monotonic deadline in a
//! min-heap. Entries are never removed eagerly: when a sleeping task is
//! cancelled its heap entry goes stale and is skipped at extraction time.

use crate::driver::TaskKey;
use crate::error::{Result, RuntimeError};
use crate::runtime;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Min-heap of sleeping tasks keyed by deadline.
///
/// A monotonically increasing sequence number makes entries with equal
/// deadlines pop in insertion order.
#[derive(Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    seq: u64,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    at: Instant,
    seq: u64,
    task: TaskKey,
}

impl TimerHeap {
    pub(crate) fn insert(&mut self, at: Instant, task: TaskKey) {
        self.seq += 1;
        self.heap.push(Reverse(TimerEntry {
            at,
            seq: self.seq,
            task,
        }));
    }

    /// Pop the next entry whose deadline has passed, if any.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<TaskKey> {
        match self.heap.peek() {
            Some(Reverse(entry)) if entry.at <= now => self.heap.pop().map(|Reverse(e)| e.task),
            _ => None,
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.at)
    }
}

/// Suspend the current task for `duration`.
///
/// A zero duration enqueues the task for the next drain without touching the
/// timer heap, which makes `sleep(Duration::ZERO)` a plain reschedule point.
pub async fn sleep(duration: Duration) -> Result<()> {
    SleepFut {
        duration,
        registered: false,
        task: None,
    }
    .await
}

struct SleepFut {
    duration: Duration,
    registered: bool,
    task: Option<TaskKey>,
}

impl Future for SleepFut {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let step = runtime::with_driver(|d| {
            let me = match d.current_task() {
                Some(k) => k,
                None => return Poll::Ready(Err(RuntimeError::usage("sleep requires a running task"))),
            };
            if let Some(err) = d.take_planned(me) {
                return Poll::Ready(Err(err));
            }
            if !this.registered {
                this.registered = true;
                this.task = Some(me);
                if this.duration.is_zero() {
                    d.park_on_ready(me, false);
                } else {
                    d.park_on_timer(me, Instant::now() + this.duration);
                }
                Poll::Pending
            } else if d.task_is_running(me) {
                Poll::Ready(Ok(()))
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

impl Drop for SleepFut {
    fn drop(&mut self) {
        if !self.registered {
            return;
        }
        if let Some(task) = self.task {
            let _ = runtime::with_driver(|d| d.abandon_wait(task));
        }
    }
}

/// Reschedule the current task behind every other runnable task.
///
/// Tasks that yield within one tick resume only in the following tick, after
/// at least one other task (if any) has made progress.
pub async fn yield_now() -> Result<()> {
    YieldFut {
        registered: false,
        task: None,
    }
    .await
}

struct YieldFut {
    registered: bool,
    task: Option<TaskKey>,
}

impl Future for YieldFut {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let step = runtime::with_driver(|d| {
            let me = match d.current_task() {
                Some(k) => k,
                None => {
                    return Poll::Ready(Err(RuntimeError::usage("yield_now requires a running task")))
                }
            };
            if let Some(err) = d.take_planned(me) {
                return Poll::Ready(Err(err));
            }
            if !this.registered {
                this.registered = true;
                this.task = Some(me);
                d.park_on_ready(me, true);
                Poll::Pending
            } else if d.task_is_running(me) {
                Poll::Ready(Ok(()))
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

impl Drop for YieldFut {
    fn drop(&mut self) {
        if !self.registered {
            return;
        }
        if let Some(task) = self.task {
            let _ = runtime::with_driver(|d| d.abandon_wait(task));
        }
    }
}

/// Yield the current task if the preempt interval has elapsed since the last
/// preemption; otherwise return immediately without suspending.
///
/// Long-running loops call this at safe points so they cannot monopolize the
/// driver for more than roughly one preempt interval.
pub async fn preempt() -> Result<()> {
    PreemptFut {
        registered: false,
        task: None,
    }
    .await
}

struct PreemptFut {
    registered: bool,
    task: Option<TaskKey>,
}

impl Future for PreemptFut {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let step = runtime::with_driver(|d| {
            let me = match d.current_task() {
                Some(k) => k,
                None => {
                    return Poll::Ready(Err(RuntimeError::usage("preempt requires a running task")))
                }
            };
            if let Some(err) = d.take_planned(me) {
                return Poll::Ready(Err(err));
            }
            if !this.registered {
                if !d.preempt_due() {
                    return Poll::Ready(Ok(()));
                }
                this.registered = true;
                this.task = Some(me);
                d.park_on_ready(me, false);
                Poll::Pending
            } else if d.task_is_running(me) {
                Poll::Ready(Ok(()))
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

impl Drop for PreemptFut {
    fn drop(&mut self) {
        if !self.registered {
            return;
        }
        if let Some(task) = self.task {
            let _ = runtime::with_driver(|d| d.abandon_wait(task));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn test_heap_pops_equal_deadlines_in_insertion_order() {
        let mut keys: SlotMap<TaskKey, ()> = SlotMap::with_key();
        let k1 = keys.insert(());
        let k2 = keys.insert(());
        let k3 = keys.insert(());

        let mut heap = TimerHeap::default();
        let at = Instant::now();
        heap.insert(at, k1);
        heap.insert(at, k2);
        heap.insert(at, k3);

        let later = at + Duration::from_millis(1);
        assert_eq!(heap.pop_due(later), Some(k1));
        assert_eq!(heap.pop_due(later), Some(k2));
        assert_eq!(heap.pop_due(later), Some(k3));
        assert_eq!(heap.pop_due(later), None);
    }

    #[test]
    fn test_heap_does_not_pop_future_deadlines() {
        let mut keys: SlotMap<TaskKey, ()> = SlotMap::with_key();
        let key = keys.insert(());

        let mut heap = TimerHeap::default();
        let now = Instant::now();
        heap.insert(now + Duration::from_secs(60), key);
        assert_eq!(heap.pop_due(now), None);
        assert_eq!(heap.next_deadline(), Some(now + Duration::from_secs(60)));
    }
}
