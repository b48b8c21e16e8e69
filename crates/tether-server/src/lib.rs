//! Server half of the tether remoting protocol.
//!
//! A [`Server`] owns the association between wire handles and real objects in
//! the wrapped API, which it drives through the [`Backend`] capability trait.
//! It decodes the client's command stream record by record, validates what
//! the backend cannot (cross-handle provenance), replays the calls, and
//! reports results — including asynchronous map completions — on the event
//! stream flowing back.

mod backend;
mod server;
mod table;
mod transfer;

pub use backend::{
    Backend, BackendBindGroupId, BackendBufferId, BackendDeviceId, BackendError, MemBackend,
    ResolvedBinding,
};
pub use server::{Server, ServerError};
pub use table::{ObjectTable, MAX_OBJECT_ID};
pub use transfer::{InlineTransfer, MemoryTransfer, ReadHandle, WriteHandle};
