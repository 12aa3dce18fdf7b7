//! Tests for select over channels, tasks, and handles

use super::test_utils::init_logging;
use crate::error::RuntimeError;
use crate::{channel, run, select, sleep, spawn, HandleSelector, JoinHandle, Selectable};
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::time::Duration;

#[test]
fn test_select_with_no_inputs_returns_none() {
    init_logging();
    let result = run(async {
        let selected = select(&[], Some(Duration::from_secs(1))).await?;
        assert_eq!(selected, None);
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_select_prefers_first_listed_ready_input() {
    init_logging();
    let result = run(async {
        let (tx1, rx1) = channel::<u32>(2);
        let (tx2, rx2) = channel::<u32>(2);
        tx1.send(1).await?;
        tx2.send(2).await?;
        let inputs: [&dyn Selectable; 2] = [&rx1, &rx2];
        let selected = select(&inputs, Some(Duration::from_secs(1))).await?;
        assert_eq!(selected, Some(0));
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_select_zero_timeout_returns_none_when_nothing_ready() {
    init_logging();
    let result = run(async {
        let (_tx, rx) = channel::<u32>(2);
        let inputs: [&dyn Selectable; 1] = [&rx];
        let selected = select(&inputs, Some(Duration::ZERO)).await?;
        assert_eq!(selected, None);
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_select_wakes_on_channel_send() {
    init_logging();
    let result = run(async {
        let (tx, rx) = channel::<u32>(2);
        let mut sender: JoinHandle<()> = spawn(async move {
            sleep(Duration::from_millis(20)).await?;
            tx.send(5).await?;
            Ok(())
        })?;
        let inputs: [&dyn Selectable; 1] = [&rx];
        let selected = select(&inputs, Some(Duration::from_secs(2))).await?;
        assert_eq!(selected, Some(0));
        assert_eq!(rx.recv().await?, Some(5));
        sender.join().await?;
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_select_on_task_completion() {
    init_logging();
    let result = run(async {
        let mut task = spawn(async {
            sleep(Duration::from_millis(20)).await?;
            Ok(13)
        })?;
        {
            let inputs: [&dyn Selectable; 1] = [&task];
            let selected = select(&inputs, Some(Duration::from_secs(2))).await?;
            assert_eq!(selected, Some(0));
        }
        assert_eq!(task.join().await?, 13);
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_select_on_handle_readiness() {
    init_logging();
    let result = run(async {
        let (local, remote) = UnixStream::pair().map_err(RuntimeError::from)?;
        let mut writer: JoinHandle<()> = spawn(async move {
            sleep(Duration::from_millis(20)).await?;
            let mut peer = &remote;
            peer.write_all(b"x").map_err(RuntimeError::from)?;
            Ok(())
        })?;
        let selector = HandleSelector::readable(&local);
        let inputs: [&dyn Selectable; 1] = [&selector];
        let selected = select(&inputs, Some(Duration::from_secs(2))).await?;
        assert_eq!(selected, Some(0));
        writer.join().await?;
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_select_times_out_with_none() {
    init_logging();
    let result = run(async {
        let (_tx, rx) = channel::<u32>(2);
        let inputs: [&dyn Selectable; 1] = [&rx];
        let selected = select(&inputs, Some(Duration::from_millis(40))).await?;
        assert_eq!(selected, None);
        Ok(())
    });
    assert!(result.is_ok());
}
