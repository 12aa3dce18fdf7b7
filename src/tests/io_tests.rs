//! Tests for I/O readiness waits and the non-blocking wrapper

use super::test_utils::init_logging;
use crate::error::RuntimeError;
use crate::{readable, run, runtime, sleep, spawn, stream, wrap, Interest, JoinHandle};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

#[test]
fn test_readable_resolves_after_peer_write() {
    init_logging();
    let result = run(async {
        let (local, remote) = UnixStream::pair().map_err(RuntimeError::from)?;
        let mut writer: JoinHandle<()> = spawn(async move {
            sleep(Duration::from_millis(20)).await?;
            let mut peer = &remote;
            peer.write_all(b"ping").map_err(RuntimeError::from)?;
            Ok(())
        })?;
        let mask = readable(&local, Some(Duration::from_secs(2))).await?;
        assert!(mask.is_readable());
        writer.join().await?;
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_writable_resolves_immediately_on_fresh_socket() {
    init_logging();
    let result = run(async {
        let (local, _remote) = UnixStream::pair().map_err(RuntimeError::from)?;
        let mask = stream(&local, Interest::WRITABLE, Some(Duration::from_secs(2))).await?;
        assert!(mask.is_writable());
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_second_waiter_on_same_handle_is_rejected() {
    init_logging();
    let result = run(async {
        let (local, _remote) = UnixStream::pair().map_err(RuntimeError::from)?;
        let fd = local.as_raw_fd();
        let mut first: JoinHandle<()> = spawn(async move {
            let waited = stream(&fd, Interest::READABLE, Some(Duration::from_millis(80))).await;
            assert_eq!(waited, Err(RuntimeError::Timeout));
            Ok(())
        })?;
        sleep(Duration::from_millis(10)).await?;
        let second = readable(&fd, Some(Duration::from_secs(1))).await;
        assert_eq!(second, Err(RuntimeError::AlreadyWaiting));
        first.join().await?;
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_cancelled_io_wait_clears_the_registry() {
    init_logging();
    let result = run(async {
        let (local, _remote) = UnixStream::pair().map_err(RuntimeError::from)?;
        let fd = local.as_raw_fd();
        let mut waiter: JoinHandle<()> = spawn(async move {
            let waited = stream(&fd, Interest::READABLE, Some(Duration::from_secs(10))).await;
            assert_eq!(waited, Err(RuntimeError::Cancelled));
            Ok(())
        })?;
        sleep(Duration::from_millis(20)).await?;
        waiter.cancel()?;
        waiter.join().await?;
        let still_registered = runtime::with_driver(|d| d.io_waiting_on(fd))?;
        assert!(!still_registered, "cancelled wait left an I/O entry behind");
        Ok(())
    });
    assert!(result.is_ok());
}

#[test]
fn test_wrapped_handle_read_write() {
    init_logging();
    let result = run(async {
        let (local, remote) = UnixStream::pair().map_err(RuntimeError::from)?;
        let mut local = wrap(local)?;
        let mut writer: JoinHandle<()> = spawn(async move {
            let mut remote = wrap(remote)?;
            sleep(Duration::from_millis(10)).await?;
            let written = remote.write(b"hello").await?;
            assert_eq!(written, 5);
            Ok(())
        })?;
        let mut buf = [0u8; 16];
        let read = local.read(&mut buf).await?;
        assert_eq!(&buf[..read], b"hello");
        writer.join().await?;
        Ok(())
    });
    assert!(result.is_ok());
}
