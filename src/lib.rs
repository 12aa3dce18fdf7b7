//! whorl: a single-threaded cooperative task runtime
//!
//! The runtime drives stackless tasks from one event loop per thread. Tasks
//! suspend only at well-defined points (timers, yields, flag waits, I/O
//! readiness, channel operations, joins, `select`), so there is exactly one
//! running task at any moment and no data race between tasks; every
//! interleaving happens at a suspension point.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! fn main() -> whorl::Result<()> {
//!     whorl::run(async {
//!         let (tx, rx) = whorl::channel::<u32>(8);
//!         let mut producer = whorl::spawn(async move {
//!             for n in 0..10 {
//!                 tx.send(n).await?;
//!                 whorl::sleep(Duration::from_millis(1)).await?;
//!             }
//!             Ok(())
//!         })?;
//!         while let Some(n) = rx.recv().await? {
//!             println!("got {n}");
//!         }
//!         producer.join().await
//!     })
//! }
//! ```

pub mod channel;
pub mod config;
pub mod defaults;
mod driver;
pub mod error;
pub mod flags;
pub mod io;
pub mod publisher;
mod runtime;
pub mod scope;
pub mod select;
pub mod task;
pub mod timer;

#[cfg(test)]
mod tests;

// Re-export the public surface for flat access
pub use channel::{channel, Receiver, Sender};
pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use flags::{await_flag, idle, raise_flag, Flag};
pub use io::{readable, stream, wrap, writable, Async, Interest, Readiness};
pub use publisher::{publisher, Publisher, Subscription};
pub use runtime::{nested, run, Runtime};
pub use scope::Scope;
pub use select::{select, HandleSelector, Selectable};
pub use task::{defer, service, spawn, spawn_batch, spawn_in, JoinHandle};
pub use timer::{preempt, sleep, yield_now};
