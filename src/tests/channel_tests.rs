//! Tests for buffered and rendezvous channels

use super::test_utils::init_logging;
use crate::error::RuntimeError;
use crate::{channel, run, sleep, spawn, JoinHandle};
use std::time::Duration;

#[test]
fn test_buffered_roundtrip_preserves_order() {
    init_logging();
    let result = run(async {
        let (tx, rx) = channel::<u32>(8);
        let mut writer = spawn(async move {
            for n in 1..=5u32 {
                tx.send(n).await?;
            }
            Ok(())
        })?;
        writer.join().await?;
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(rx.recv().await?);
        }
        assert_eq!(
            seen,
            vec![Some(1), Some(2), Some(3), Some(4), Some(5)]
        );
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_close_is_idempotent_and_readers_drain() {
    init_logging();
    let result = run(async {
        let (tx, rx) = channel::<u32>(4);
        tx.send(1).await?;
        tx.send(2).await?;
        tx.close();
        tx.close();
        assert_eq!(tx.send(3).await, Err(RuntimeError::ChannelClosed));
        assert_eq!(rx.recv().await?, Some(1));
        assert_eq!(rx.recv().await?, Some(2));
        assert_eq!(rx.recv().await?, None);
        assert_eq!(rx.recv().await?, None);
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_parked_writer_fails_on_close() {
    init_logging();
    let result = run(async {
        let (tx, rx) = channel::<u32>(1);
        tx.send(1).await?;
        let tx2 = tx.clone();
        let mut writer: JoinHandle<()> = spawn(async move {
            let sent = tx2.send(2).await;
            assert_eq!(sent, Err(RuntimeError::ChannelClosed));
            Ok(())
        })?;
        sleep(Duration::from_millis(20)).await?;
        tx.close();
        writer.join().await?;
        // the blocked writer's value was never delivered
        assert_eq!(rx.recv().await?, Some(1));
        assert_eq!(rx.recv().await?, None);
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_dropping_sender_closes_channel() {
    init_logging();
    let result = run(async {
        let (tx, rx) = channel::<u32>(4);
        let mut writer = spawn(async move {
            tx.send(7).await?;
            Ok(())
            // tx dropped here: last sender closes the channel
        })?;
        writer.join().await?;
        assert_eq!(rx.recv().await?, Some(7));
        assert_eq!(rx.recv().await?, None);
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_backpressure_with_capacity_two() {
    init_logging();
    let result = run(async {
        let (tx, rx) = channel::<u32>(2);
        let mut producer: JoinHandle<()> = spawn(async move {
            for n in 1..=5u32 {
                tx.send(n).await?;
                sleep(Duration::from_millis(1)).await?;
            }
            Ok(())
        })?;
        let mut consumer = spawn(async move {
            let mut seen = Vec::new();
            loop {
                // capacity is the hard ceiling even while the producer races
                assert!(rx.len() <= 2);
                match rx.recv().await? {
                    Some(value) => {
                        seen.push(value);
                        sleep(Duration::from_millis(5)).await?;
                    }
                    None => break,
                }
            }
            Ok(seen)
        })?;
        producer.join().await?;
        let seen = consumer.join().await?;
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_multiple_writers_served_in_enqueue_order() {
    init_logging();
    let result = run(async {
        let (tx, rx) = channel::<u32>(1);
        let mut writers = Vec::new();
        for n in 1..=3u32 {
            let tx = tx.clone();
            writers.push(spawn(async move {
                tx.send(n).await?;
                Ok(())
            })?);
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await?.expect("value"));
        }
        assert_eq!(seen, vec![1, 2, 3]);
        for mut writer in writers {
            writer.join().await?;
        }
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_recv_times_out_on_empty_channel() {
    init_logging();
    let result = run(async {
        let (tx, rx) = channel::<u32>(2);
        let mut reader: JoinHandle<()> = spawn(async move {
            let got = rx.recv_timeout(Duration::from_millis(40)).await;
            assert_eq!(got, Err(RuntimeError::Timeout));
            Ok(())
        })?;
        reader.join().await?;
        drop(tx);
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_creator_guard_blocks_first_lonely_op() {
    init_logging();
    let result = run(async {
        let (tx, rx) = channel::<u32>(0);
        // the creating task blocking while nothing else is engaged would
        // deadlock the channel
        let blocked = tx.send(1).await;
        assert!(matches!(blocked, Err(RuntimeError::UsageError(_))));

        // once another task is parked on the channel the guard is gone
        let mut reader = spawn(async move { rx.recv().await })?;
        sleep(Duration::from_millis(20)).await?;
        tx.send(9).await?;
        assert_eq!(reader.join().await?, Some(9));
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_rendezvous_ping_pong_ten_thousand_roundtrips() {
    init_logging();
    let result = run(async {
        const ROUNDS: u64 = 10_000;
        let (ping_tx, ping_rx) = channel::<u64>(0);
        let (pong_tx, pong_rx) = channel::<u64>(0);

        let mut a = spawn(async move {
            let mut count = 0u64;
            for n in 0..ROUNDS {
                ping_tx.send(n).await?;
                let echoed = pong_rx.recv().await?;
                assert_eq!(echoed, Some(n));
                count += 1;
            }
            ping_tx.close();
            Ok(count)
        })?;
        let mut b = spawn(async move {
            let mut count = 0u64;
            while let Some(value) = ping_rx.recv().await? {
                pong_tx.send(value).await?;
                count += 1;
            }
            Ok(count)
        })?;

        assert_eq!(a.join_timeout(Duration::from_secs(120)).await?, ROUNDS);
        assert_eq!(b.join_timeout(Duration::from_secs(120)).await?, ROUNDS);
        Ok(())
    });
    assert!(result.is_ok());
}
