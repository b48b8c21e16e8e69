//! Client half of the tether remoting protocol.
//!
//! A [`Client`] is the only thing application code touches: calls against it
//! construct command records, allocate result handles eagerly, and buffer
//! everything until [`Client::flush`] hands one message to the injected
//! transport. Completions flow back through [`Client::handle_events`] and are
//! delivered to the registered callbacks under the [`CallbackMode`] chosen
//! per call, exactly once each — including under disconnect, release before
//! completion, and re-entrant callbacks.

mod allocator;
mod buffer;
mod client;
mod device;
mod futures;
mod transfer;

pub use client::{Client, ClientError};
pub use device::ErrorCallback;
pub use futures::{CallbackMode, FeaturesCallback, FeaturesResponse, MapCallback};
pub use transfer::{InlineTransfer, MemoryTransfer, ReadHandle, WriteHandle};
