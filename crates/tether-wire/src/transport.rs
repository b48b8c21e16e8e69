//! Injected transport seam.
//!
//! The protocol assumes an in-order, at-most-once byte pipe per direction and
//! performs no retries itself. `MemoryPipe` is the same-process
//! implementation used by tests and single-process embedders; real embedders
//! substitute sockets, shared-memory rings, or whatever else they have.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
}

/// One direction of the duplex channel between client and server.
pub trait Transport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
}

struct PipeShared {
    queue: RefCell<VecDeque<Vec<u8>>>,
    closed: std::cell::Cell<bool>,
}

/// Producer half of an in-memory message queue.
pub struct MemoryPipe {
    shared: Rc<PipeShared>,
}

/// Consumer half; the embedder pumps messages into the peer's
/// `handle_commands` / `handle_events`.
pub struct PipeReceiver {
    shared: Rc<PipeShared>,
}

impl MemoryPipe {
    pub fn pair() -> (MemoryPipe, PipeReceiver) {
        let shared = Rc::new(PipeShared {
            queue: RefCell::new(VecDeque::new()),
            closed: std::cell::Cell::new(false),
        });
        (
            MemoryPipe {
                shared: Rc::clone(&shared),
            },
            PipeReceiver { shared },
        )
    }
}

impl Transport for MemoryPipe {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.shared.closed.get() {
            return Err(TransportError::Closed);
        }
        self.shared.queue.borrow_mut().push_back(bytes.to_vec());
        Ok(())
    }
}

impl PipeReceiver {
    /// Pops the oldest in-flight message, if any.
    pub fn recv(&self) -> Option<Vec<u8>> {
        self.shared.queue.borrow_mut().pop_front()
    }

    /// Drains every in-flight message in order.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.shared.queue.borrow_mut().drain(..).collect()
    }

    /// Severs the pipe; subsequent sends fail with [`TransportError::Closed`].
    pub fn close(&self) {
        self.shared.closed.set(true);
    }
}
