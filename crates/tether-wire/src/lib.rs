//! Wire-level data model and codec for the tether remoting protocol.
//!
//! A client records API calls against a capability-object GPU-style API into
//! a command stream; a server decodes and replays them against the real
//! implementation and reports results (including async completions) on an
//! event stream flowing the other way. This crate defines the pieces both
//! sides share:
//!
//! - opaque `(id, generation)` object handles
//! - tagged, bounds-checked command/event records and their framing
//! - chained extension structs on descriptors
//! - the injected transport seam plus an in-memory pipe for tests

mod cmd;
mod extension;
mod handle;
pub mod transport;

pub use cmd::{
    decode_command, decode_event, encode_command, encode_command_into, encode_event,
    encode_event_into, push_record, BindGroupEntry, BufferDescriptor, BufferUsages, Command,
    ErrorKind, Event, MapMode, MapStatus, RecordIter, WireError, MAX_RECORD_BYTES,
};
pub use extension::{BufferExtension, MAX_EXTENSION_LINKS};
pub use handle::{FutureId, ObjectHandle, ObjectType};
