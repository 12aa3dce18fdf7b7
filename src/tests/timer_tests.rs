//! Tests for sleep timing behavior

use super::test_utils::init_logging;
use crate::{run, sleep, spawn};
use std::time::{Duration, Instant};

#[test]
fn test_sleep_waits_at_least_the_requested_duration() {
    init_logging();
    let started = Instant::now();
    let result = run(async {
        sleep(Duration::from_millis(50)).await?;
        Ok(())
    });
    assert!(result.is_ok());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(50), "woke early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "woke late: {:?}", elapsed);
}

#[test]
fn test_sleepers_resume_in_deadline_order() {
    init_logging();
    let result = run(async {
        let order: std::rc::Rc<std::cell::RefCell<Vec<u32>>> = Default::default();
        let o1 = order.clone();
        let mut long = spawn(async move {
            sleep(Duration::from_millis(60)).await?;
            o1.borrow_mut().push(60);
            Ok(())
        })?;
        let o2 = order.clone();
        let mut short = spawn(async move {
            sleep(Duration::from_millis(20)).await?;
            o2.borrow_mut().push(20);
            Ok(())
        })?;
        long.join().await?;
        short.join().await?;
        assert_eq!(*order.borrow(), vec![20, 60]);
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_many_sleepers_all_resume() {
    init_logging();
    let result = run(async {
        let mut handles = Vec::new();
        for n in 0..20u64 {
            handles.push(spawn(async move {
                sleep(Duration::from_millis(n % 7)).await?;
                Ok(n)
            })?);
        }
        let mut total = 0;
        for mut handle in handles {
            total += handle.join().await?;
        }
        assert_eq!(total, (0..20).sum::<u64>());
        Ok(())
    });
    assert!(result.is_ok());
}
