//! Publisher: fan-out over a readable channel
//!
//! A publisher turns one receiver into any number of independent
//! subscription streams. Messages are appended to a singly-linked chain;
//! every subscription holds its own cursor into the chain, so late
//! subscribers simply start at the current tail and observe only the
//! messages published after they joined.
//!
//! A detached service task drives the source channel, but only while at
//! least one subscription is waiting for a new message; with no demand the
//! service parks on the demand flag instead of consuming the source.

use crate::channel::Receiver;
use crate::error::{Result, RuntimeError};
use crate::flags::{self, Flag};
use crate::task;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, warn};

enum NodeState<T> {
    /// Not yet published; the chain tail.
    Pending,
    /// A published message and the link to the next node.
    Ready(T, Rc<Node<T>>),
    /// The source closed; every cursor converges here.
    Closed,
}

struct Node<T> {
    state: RefCell<NodeState<T>>,
}

impl<T> Node<T> {
    fn pending() -> Rc<Self> {
        Rc::new(Node {
            state: RefCell::new(NodeState::Pending),
        })
    }
}

struct Shared<T> {
    tail: RefCell<Rc<Node<T>>>,
    message_flag: Flag,
    demand_flag: Flag,
    waiting: Cell<usize>,
}

/// Fan-out adaptor handle; cheap to clone, used to create subscriptions.
pub struct Publisher<T> {
    shared: Rc<Shared<T>>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Publisher {
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("waiting", &self.shared.waiting.get())
            .finish()
    }
}

/// One subscriber's independent view of the published stream.
pub struct Subscription<T> {
    cursor: Rc<Node<T>>,
    shared: Rc<Shared<T>>,
}

/// Build a publisher over `source` and start its driving service task.
///
/// Must be called inside the runtime.
pub fn publisher<T: Clone + 'static>(source: Receiver<T>) -> Result<Publisher<T>> {
    let shared = Rc::new(Shared {
        tail: RefCell::new(Node::pending()),
        message_flag: Flag::new(),
        demand_flag: Flag::new(),
        waiting: Cell::new(0),
    });
    let driver_shared = shared.clone();
    task::service(async move {
        drive_source(driver_shared, source).await;
        Ok(())
    })?;
    Ok(Publisher { shared })
}

async fn drive_source<T: Clone>(shared: Rc<Shared<T>>, source: Receiver<T>) {
    loop {
        // only pull from the source while a subscriber is actually waiting
        while shared.waiting.get() == 0 {
            if flags::await_flag_forever(&shared.demand_flag).await.is_err() {
                close_chain(&shared);
                return;
            }
        }
        match source.recv().await {
            Ok(Some(message)) => {
                append(&shared, message);
                let _ = flags::raise_flag(&shared.message_flag);
            }
            Ok(None) => {
                debug!("publisher source closed");
                close_chain(&shared);
                return;
            }
            Err(RuntimeError::Timeout) => {
                // a quiet source is not an error; keep driving while
                // subscribers still wait
                continue;
            }
            Err(e) => {
                warn!(error = %e, "publisher source failed");
                close_chain(&shared);
                return;
            }
        }
    }
}

fn append<T>(shared: &Shared<T>, message: T) {
    let next = Node::pending();
    let tail = shared.tail.borrow().clone();
    *tail.state.borrow_mut() = NodeState::Ready(message, next.clone());
    *shared.tail.borrow_mut() = next;
}

fn close_chain<T>(shared: &Shared<T>) {
    let tail = shared.tail.borrow().clone();
    *tail.state.borrow_mut() = NodeState::Closed;
    let _ = flags::raise_flag(&shared.message_flag);
}

impl<T: Clone> Publisher<T> {
    /// Open a subscription starting at the current tail of the stream.
    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            cursor: self.shared.tail.borrow().clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("waiting", &self.shared.waiting.get())
            .finish()
    }
}

impl<T: Clone> Subscription<T> {
    /// Receive the next published message, or `Ok(None)` once the source has
    /// closed and the cursor reached the end of the chain. Uses the default
    /// timeout.
    pub async fn recv(&mut self) -> Result<Option<T>> {
        self.recv_deadline(None).await
    }

    /// Receive with an explicit timeout.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<T>> {
        self.recv_deadline(Some(timeout)).await
    }

    async fn recv_deadline(&mut self, timeout: Option<Duration>) -> Result<Option<T>> {
        loop {
            let step = {
                let state = self.cursor.state.borrow();
                match &*state {
                    NodeState::Ready(message, next) => Some((message.clone(), next.clone())),
                    NodeState::Closed => return Ok(None),
                    NodeState::Pending => None,
                }
            };
            if let Some((message, next)) = step {
                self.cursor = next;
                return Ok(Some(message));
            }
            self.shared.waiting.set(self.shared.waiting.get() + 1);
            let _ = flags::raise_flag(&self.shared.demand_flag);
            let waited = flags::await_flag(&self.shared.message_flag, timeout).await;
            self.shared.waiting.set(self.shared.waiting.get().saturating_sub(1));
            waited?;
        }
    }
}
