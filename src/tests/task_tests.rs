//! Tests for task lifecycle: join, cancel, escalation, defer, batches

use super::test_utils::{event_log, events, init_logging, push};
use crate::error::RuntimeError;
use crate::{defer, run, service, sleep, spawn, spawn_batch, JoinHandle};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

#[test]
fn test_spawn_and_join_value() {
    init_logging();
    let result = run(async {
        let mut handle = spawn(async { Ok(11) })?;
        let value = handle.join().await?;
        Ok(value * 2)
    });
    assert_eq!(result, Ok(22));
}

#[test]
fn test_join_rethrows_task_error() {
    init_logging();
    let result = run(async {
        let mut handle: JoinHandle<()> =
            spawn(async { Err(RuntimeError::usage("task failed")) })?;
        let joined = handle.join().await;
        assert_eq!(joined, Err(RuntimeError::UsageError("task failed".into())));
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_join_timeout_then_claim_later() {
    init_logging();
    let result = run(async {
        let mut handle = spawn(async {
            sleep(Duration::from_millis(400)).await?;
            Ok(9)
        })?;
        let first = handle.join_timeout(Duration::from_millis(30)).await;
        assert_eq!(first, Err(RuntimeError::Timeout));
        // the task kept running; a second join claims the value
        let second = handle.join().await?;
        assert_eq!(second, 9);
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_cancel_sleeping_task() {
    init_logging();
    let result = run(async {
        let mut handle: JoinHandle<()> = spawn(async {
            sleep(Duration::from_secs(10)).await?;
            Ok(())
        })?;
        sleep(Duration::from_millis(30)).await?;
        handle.cancel()?;
        let joined = handle.join().await;
        assert_eq!(joined, Err(RuntimeError::Cancelled));
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_cancel_terminated_task_is_not_blocked() {
    init_logging();
    let result = run(async {
        let mut handle = spawn(async { Ok(1) })?;
        sleep(Duration::from_millis(20)).await?;
        assert_eq!(handle.cancel(), Err(RuntimeError::NotBlocked));
        assert_eq!(handle.join().await, Ok(1));
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_cancel_after_timeout_is_not_blocked() {
    init_logging();
    let result = run(async {
        let flag = crate::Flag::new();
        let waiter_flag = flag.clone();
        let mut handle: JoinHandle<()> = spawn(async move {
            let waited = crate::await_flag(&waiter_flag, Some(Duration::from_millis(30))).await;
            assert_eq!(waited, Err(RuntimeError::Timeout));
            Ok(())
        })?;
        // long enough that the sweep has fired the timeout and the task ended
        sleep(Duration::from_millis(300)).await?;
        assert_eq!(handle.cancel(), Err(RuntimeError::NotBlocked));
        handle.join().await?;
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_cyclic_await_is_rejected() {
    init_logging();
    let log = event_log();
    let result = run({
        let log = log.clone();
        async move {
            let b_slot: Rc<RefCell<Option<JoinHandle<()>>>> = Rc::new(RefCell::new(None));
            let b_slot_for_a = b_slot.clone();
            let log_a = log.clone();
            let ha: JoinHandle<()> = spawn(async move {
                sleep(Duration::from_millis(20)).await?;
                let mut hb = b_slot_for_a
                    .borrow_mut()
                    .take()
                    .ok_or_else(|| RuntimeError::usage("handle missing"))?;
                match hb.join().await {
                    Err(RuntimeError::CyclicAwait) => push(&log_a, "cycle detected"),
                    other => push(&log_a, &format!("unexpected: {:?}", other)),
                }
                Ok(())
            })?;
            // B starts awaiting A right away; A awaits B once it has the
            // handle, which closes the cycle
            let hb: JoinHandle<()> = spawn(async move {
                let mut ha = ha;
                ha.join().await
            })?;
            *b_slot.borrow_mut() = Some(hb);
            sleep(Duration::from_millis(80)).await?;
            Ok(())
        }
    });
    assert!(result.is_ok());
    assert_eq!(events(&log), vec!["cycle detected"]);
}

#[test]
fn test_deferred_closures_run_in_reverse_order() {
    init_logging();
    let log = event_log();
    let result = run({
        let log = log.clone();
        async move {
            let log_t = log.clone();
            let mut handle = spawn(async move {
                let l1 = log_t.clone();
                defer(move || push(&l1, "first"))?;
                let l2 = log_t.clone();
                defer(move || push(&l2, "second"))?;
                let l3 = log_t.clone();
                defer(move || push(&l3, "third"))?;
                Ok(())
            })?;
            handle.join().await?;
            // give the micro-task queue a turn
            sleep(Duration::ZERO).await?;
            Ok(())
        }
    });
    assert!(result.is_ok());
    assert_eq!(events(&log), vec!["third", "second", "first"]);
}

#[test]
fn test_deferred_closures_run_on_cancellation() {
    init_logging();
    let log = event_log();
    let result = run({
        let log = log.clone();
        async move {
            let log_t = log.clone();
            let mut handle: JoinHandle<()> = spawn(async move {
                let l = log_t.clone();
                defer(move || push(&l, "cleanup"))?;
                sleep(Duration::from_secs(10)).await?;
                Ok(())
            })?;
            sleep(Duration::from_millis(20)).await?;
            handle.cancel()?;
            assert_eq!(handle.join().await, Err(RuntimeError::Cancelled));
            sleep(Duration::ZERO).await?;
            Ok(())
        }
    });
    assert!(result.is_ok());
    assert_eq!(events(&log), vec!["cleanup"]);
}

#[test]
fn test_unclaimed_error_escalates_to_parent() {
    init_logging();
    let result = run(async {
        let mut parent: JoinHandle<()> = spawn(async {
            // child handle dropped immediately: its error has no claimant
            let child: JoinHandle<()> = spawn(async {
                sleep(Duration::from_millis(20)).await?;
                Err(RuntimeError::usage("child exploded"))
            })?;
            drop(child);
            // the escalated error lands at this suspension point
            sleep(Duration::from_secs(10)).await
        })?;
        let joined = parent.join().await;
        assert_eq!(
            joined,
            Err(RuntimeError::UsageError("child exploded".into()))
        );
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_unclaimed_error_without_ancestor_surfaces_from_run() {
    init_logging();
    let result: crate::Result<u32> = run(async {
        let child: JoinHandle<()> = spawn(async {
            sleep(Duration::from_millis(20)).await?;
            Err(RuntimeError::usage("orphan failure"))
        })?;
        drop(child);
        // the root terminates first, so the error can only reach the scope
        Ok(5)
    });
    assert_eq!(result, Err(RuntimeError::UsageError("orphan failure".into())));
}

#[test]
fn test_spawn_batch_collects_ordered_results() {
    init_logging();
    let result = run(async {
        let mut batch = spawn_batch(4, |index| async move {
            sleep(Duration::from_millis(5)).await?;
            if index == 2 {
                Err(RuntimeError::usage("batch member failed"))
            } else {
                Ok(index * index)
            }
        })?;
        let results = batch.join().await?;
        assert_eq!(results.len(), 4);
        assert_eq!(results[0], Ok(0));
        assert_eq!(results[1], Ok(1));
        assert_eq!(
            results[2],
            Err(RuntimeError::UsageError("batch member failed".into()))
        );
        assert_eq!(results[3], Ok(9));
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_service_runs_outside_caller_scope() {
    init_logging();
    let done = Rc::new(Cell::new(false));
    let result = run({
        let done = done.clone();
        async move {
            let done_inner = done.clone();
            let handle = service(async move {
                sleep(Duration::from_millis(10)).await?;
                done_inner.set(true);
                Ok(())
            })?;
            drop(handle);
            sleep(Duration::from_millis(60)).await?;
            Ok(())
        }
    });
    assert!(result.is_ok());
    assert!(done.get());
}

#[test]
fn test_lingering_service_does_not_block_run() {
    init_logging();
    let started = Instant::now();
    let result = run(async {
        let handle: JoinHandle<()> = service(async {
            sleep(Duration::from_secs(30)).await?;
            Ok(())
        })?;
        drop(handle);
        Ok(1)
    });
    assert_eq!(result, Ok(1));
    assert!(started.elapsed() < Duration::from_secs(5));
}
