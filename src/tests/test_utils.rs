//! Shared helpers for the runtime test suite

use std::cell::RefCell;
use std::rc::Rc;

/// Initialize tracing output for a test. Respects `RUST_LOG`; safe to call
/// from every test.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Shared, single-threaded event log for asserting resume order.
pub type EventLog = Rc<RefCell<Vec<String>>>;

pub fn event_log() -> EventLog {
    Rc::new(RefCell::new(Vec::new()))
}

pub fn push(log: &EventLog, event: &str) {
    log.borrow_mut().push(event.to_string());
}

pub fn events(log: &EventLog) -> Vec<String> {
    log.borrow().clone()
}
