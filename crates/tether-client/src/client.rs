//! Client connection state machine.
//!
//! Application code talks to a [`Client`]: every call constructs a command
//! record, allocates any result handles eagerly (so return values are usable
//! before the server has confirmed anything), and appends the record to the
//! outgoing stream. `flush` pushes the stream to the transport; the embedder
//! feeds the server's event stream back in through `handle_events`.
//!
//! All mutation happens on the caller's thread. "Async" operations are
//! deferred delivery, not concurrency: completion callbacks run inside
//! `handle_events`, `wait_any`, `process_events`, `disconnect`, or a release
//! call, always with `&mut Client` so they can re-enter the connection.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tracing::{debug, trace, warn};

use tether_wire::transport::{Transport, TransportError};
use tether_wire::{
    decode_event, encode_command, push_record, BindGroupEntry, BufferDescriptor, BufferUsages,
    Command, ErrorKind, Event, FutureId, MapMode, MapStatus, ObjectHandle, ObjectType, RecordIter,
    WireError,
};

use crate::allocator::HandleAllocator;
use crate::buffer::{BufferRecord, MapState, PendingMap};
use crate::device::{DeviceRecord, ErrorCallback};
use crate::futures::{
    CallbackMode, FeaturesCallback, FeaturesResponse, FutureRegistry, MapCallback, PendingOp,
    ReadyOp,
};
use crate::transfer::MemoryTransfer;

/// Local failures: caught client-side, never serialized.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection is disconnected")]
    Disconnected,

    #[error("stale or unknown handle")]
    InvalidHandle,

    #[error("invalid call: {0}")]
    Validation(&'static str),

    #[error("memory transfer handle allocation failed")]
    TransferAllocation,

    #[error("transport failure")]
    Transport(#[from] TransportError),
}

/// Client half of one connection. One per remoted API instance; independent
/// connections share nothing.
pub struct Client {
    transport: Box<dyn Transport>,
    transfer: Box<dyn MemoryTransfer>,
    connected: bool,
    /// Command records accumulated since the last flush.
    stream: Vec<u8>,
    device_alloc: HandleAllocator,
    buffer_alloc: HandleAllocator,
    bind_group_alloc: HandleAllocator,
    devices: HashMap<ObjectHandle, DeviceRecord>,
    buffers: HashMap<ObjectHandle, BufferRecord>,
    bind_groups: HashSet<ObjectHandle>,
    futures: FutureRegistry,
}

impl Client {
    pub fn connect(transport: Box<dyn Transport>, transfer: Box<dyn MemoryTransfer>) -> Self {
        Self {
            transport,
            transfer,
            connected: true,
            stream: Vec::new(),
            device_alloc: HandleAllocator::new(),
            buffer_alloc: HandleAllocator::new(),
            bind_group_alloc: HandleAllocator::new(),
            devices: HashMap::new(),
            buffers: HashMap::new(),
            bind_groups: HashSet::new(),
            futures: FutureRegistry::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Allocates a device handle with no create command: the server side is
    /// expected to bind a pre-existing backend object to the same handle via
    /// its injection API. The reservation shares the id space with every
    /// other device handle, so it can never collide with a live id.
    pub fn reserve_device(&mut self) -> ObjectHandle {
        let handle = self.device_alloc.allocate();
        self.devices.insert(handle, DeviceRecord::default());
        trace!(id = handle.id, generation = handle.generation, "reserved device handle");
        handle
    }

    /// Installs the device error callback. API-level errors, cross-handle
    /// validation failures injected by the server, and locally detected
    /// validation errors all arrive here.
    pub fn on_uncaptured_error(
        &mut self,
        device: ObjectHandle,
        callback: ErrorCallback,
    ) -> Result<(), ClientError> {
        let record = self
            .devices
            .get_mut(&device)
            .ok_or(ClientError::InvalidHandle)?;
        record.error_callback = Some(callback);
        Ok(())
    }

    pub fn create_buffer(
        &mut self,
        device: ObjectHandle,
        desc: &BufferDescriptor,
    ) -> Result<ObjectHandle, ClientError> {
        if !self.connected {
            return Err(ClientError::Disconnected);
        }
        if !self.devices.contains_key(&device) {
            return Err(ClientError::InvalidHandle);
        }
        if let Some(message) = validate_buffer_descriptor(desc) {
            // The malformed call is never sent; the error notification is
            // reflected through the server so both sides see one stream.
            self.report_local_validation(device, message);
            return Err(ClientError::Validation(message));
        }

        let result = self.buffer_alloc.allocate();
        let mut record = BufferRecord::new(desc.size, desc.usage);
        let write_handle_create = if desc.mapped_at_creation {
            let Some(handle) = self.transfer.create_write_handle(desc.size) else {
                self.buffer_alloc.release(result);
                return Err(ClientError::TransferAllocation);
            };
            let create = handle.serialize_create();
            record.map = MapState::MappedAtCreation { size: desc.size };
            record.write_handle = Some(handle);
            Some(create)
        } else {
            None
        };
        self.buffers.insert(result, record);
        self.push(&Command::DeviceCreateBuffer {
            device,
            result,
            desc: desc.clone(),
            write_handle_create,
        });
        Ok(result)
    }

    /// Entry buffers need only exist locally; cross-handle rules (every
    /// buffer sharing the bind group's device) are the server gateway's to
    /// enforce, since a release pipelined behind this call can invalidate an
    /// entry before the server sees it.
    pub fn create_bind_group(
        &mut self,
        device: ObjectHandle,
        entries: &[BindGroupEntry],
    ) -> Result<ObjectHandle, ClientError> {
        if !self.connected {
            return Err(ClientError::Disconnected);
        }
        if !self.devices.contains_key(&device) {
            return Err(ClientError::InvalidHandle);
        }
        if entries.iter().any(|e| !self.buffers.contains_key(&e.buffer)) {
            return Err(ClientError::InvalidHandle);
        }
        let result = self.bind_group_alloc.allocate();
        self.bind_groups.insert(result);
        self.push(&Command::DeviceCreateBindGroup {
            device,
            result,
            entries: entries.to_vec(),
        });
        Ok(result)
    }

    /// Requests the device's dynamic feature list. `callback` fires exactly
    /// once with the list, or with a lost/destroyed status if the connection
    /// or device goes away first.
    pub fn request_features(
        &mut self,
        device: ObjectHandle,
        mode: CallbackMode,
        callback: FeaturesCallback,
    ) -> Result<FutureId, ClientError> {
        if !self.connected {
            let future = self.futures.next_id();
            callback(self, FeaturesResponse::ConnectionLost);
            return Ok(future);
        }
        if !self.devices.contains_key(&device) {
            return Err(ClientError::InvalidHandle);
        }
        let future = self.futures.next_id();
        self.futures
            .register(future, mode, PendingOp::Features { device, callback });
        self.push(&Command::DeviceRequestFeatures { device, future });
        Ok(future)
    }

    /// Older call form of [`Client::request_features`], without the future
    /// id.
    pub fn enumerate_features(
        &mut self,
        device: ObjectHandle,
        callback: FeaturesCallback,
    ) -> Result<(), ClientError> {
        self.request_features(device, CallbackMode::LegacyAsync, callback)
            .map(|_| ())
    }

    /// Requests a map of `[offset, offset + size)`.
    ///
    /// Local failures (stale range, usage mismatch, a map already pending,
    /// disconnected client) fire the callback immediately and send nothing.
    pub fn buffer_map_async(
        &mut self,
        buffer: ObjectHandle,
        mode: MapMode,
        offset: u64,
        size: u64,
        callback_mode: CallbackMode,
        callback: MapCallback,
    ) -> Result<FutureId, ClientError> {
        let future = self.futures.next_id();
        if !self.connected {
            callback(self, MapStatus::DeviceLost);
            return Ok(future);
        }
        let Some(record) = self.buffers.get(&buffer) else {
            return Err(ClientError::InvalidHandle);
        };
        let usage_ok = match mode {
            MapMode::Read => record.usage.contains(BufferUsages::MAP_READ),
            MapMode::Write => record.usage.contains(BufferUsages::MAP_WRITE),
        };
        let in_bounds = offset
            .checked_add(size)
            .is_some_and(|end| end <= record.size);
        if record.pending.is_some() || record.is_mapped() || !usage_ok || !in_bounds {
            // Only one map per buffer may be in flight; the rest are caught
            // here without touching the wire.
            callback(self, MapStatus::Error);
            return Ok(future);
        }

        enum Created {
            Read(Box<dyn crate::transfer::ReadHandle>, Vec<u8>),
            Write(Box<dyn crate::transfer::WriteHandle>, Vec<u8>),
        }
        let created = match mode {
            MapMode::Read => self
                .transfer
                .create_read_handle(size)
                .map(|h| {
                    let create = h.serialize_create();
                    Created::Read(h, create)
                }),
            MapMode::Write => self
                .transfer
                .create_write_handle(size)
                .map(|h| {
                    let create = h.serialize_create();
                    Created::Write(h, create)
                }),
        };
        let Some(created) = created else {
            callback(self, MapStatus::Error);
            return Ok(future);
        };

        let Some(record) = self.buffers.get_mut(&buffer) else {
            return Err(ClientError::InvalidHandle);
        };
        let handle_create = match created {
            Created::Read(handle, create) => {
                record.read_handle = Some(handle);
                create
            }
            Created::Write(handle, create) => {
                record.write_handle = Some(handle);
                create
            }
        };
        record.pending = Some(PendingMap {
            future,
            mode,
            offset,
            size,
            override_status: None,
        });
        self.futures
            .register(future, callback_mode, PendingOp::Map { buffer, callback });
        self.push(&Command::BufferMapAsync {
            buffer,
            future,
            mode,
            offset,
            size,
            handle_create,
        });
        Ok(future)
    }

    /// Older call form of [`Client::buffer_map_async`]: no future id, the
    /// callback fires as soon as the completion is observed. Equivalent to
    /// the full form in [`CallbackMode::LegacyAsync`] mode.
    pub fn buffer_map(
        &mut self,
        buffer: ObjectHandle,
        mode: MapMode,
        offset: u64,
        size: u64,
        callback: MapCallback,
    ) -> Result<(), ClientError> {
        self.buffer_map_async(buffer, mode, offset, size, CallbackMode::LegacyAsync, callback)
            .map(|_| ())
    }

    /// Bounds-checked read view of the mapped span.
    pub fn buffer_mapped_range(
        &self,
        buffer: ObjectHandle,
        offset: u64,
        size: u64,
    ) -> Result<&[u8], ClientError> {
        let record = self.buffers.get(&buffer).ok_or(ClientError::InvalidHandle)?;
        let (map_offset, map_size) = record
            .readable_range()
            .ok_or(ClientError::Validation("buffer is not mapped"))?;
        let rel = checked_subrange(offset, size, map_offset, map_size)?;
        let data = match record.map {
            MapState::MappedForRead { .. } => record
                .read_handle
                .as_ref()
                .ok_or(ClientError::Validation("buffer is not mapped"))?
                .data(),
            _ => record
                .write_handle
                .as_ref()
                .ok_or(ClientError::Validation("buffer is not mapped"))?
                .data(),
        };
        Ok(&data[rel])
    }

    /// Bounds-checked write view of the mapped span. Read maps have no
    /// writable span.
    pub fn buffer_mapped_range_mut(
        &mut self,
        buffer: ObjectHandle,
        offset: u64,
        size: u64,
    ) -> Result<&mut [u8], ClientError> {
        let record = self
            .buffers
            .get_mut(&buffer)
            .ok_or(ClientError::InvalidHandle)?;
        let (map_offset, map_size) = record
            .writable_range()
            .ok_or(ClientError::Validation("buffer is not mapped for writing"))?;
        let rel = checked_subrange(offset, size, map_offset, map_size)?;
        let data = record
            .write_handle
            .as_mut()
            .ok_or(ClientError::Validation("buffer is not mapped for writing"))?
            .data_mut();
        Ok(&mut data[rel])
    }

    /// Ends the current map cycle. A write span serializes its flush payload
    /// before the unmap record so the server applies the writes first; a map
    /// request still in flight is tagged so the late completion downgrades to
    /// `UnmappedBeforeCallback`.
    pub fn buffer_unmap(&mut self, buffer: ObjectHandle) -> Result<(), ClientError> {
        let record = self
            .buffers
            .get_mut(&buffer)
            .ok_or(ClientError::InvalidHandle)?;
        if !record.is_mapped() && record.pending.is_none() {
            return Err(ClientError::Validation("buffer is not mapped"));
        }
        if let Some(pending) = record.pending.as_mut() {
            if pending.override_status.is_none() {
                pending.override_status = Some(MapStatus::UnmappedBeforeCallback);
            }
        }
        let flush = match record.map {
            MapState::MappedForWrite { offset, size } => record
                .write_handle
                .as_mut()
                .and_then(|h| h.serialize_update())
                .map(|payload| (offset, size, payload)),
            MapState::MappedAtCreation { size } => record
                .write_handle
                .as_mut()
                .and_then(|h| h.serialize_update())
                .map(|payload| (0, size, payload)),
            _ => None,
        };
        record.map = MapState::Unmapped;
        record.read_handle = None;
        record.write_handle = None;
        if self.connected {
            if let Some((offset, size, flush_payload)) = flush {
                self.push(&Command::BufferUpdateMappedData {
                    buffer,
                    offset,
                    size,
                    flush_payload,
                });
            }
            self.push(&Command::BufferUnmap { buffer });
        }
        Ok(())
    }

    /// Drops the buffer. A map request still outstanding resolves with
    /// `DestroyedBeforeCallback` before the release record is queued.
    pub fn release_buffer(&mut self, buffer: ObjectHandle) -> Result<(), ClientError> {
        let record = self
            .buffers
            .remove(&buffer)
            .ok_or(ClientError::InvalidHandle)?;
        self.buffer_alloc.release(buffer);
        if let Some(pending) = record.pending {
            if let Some(future) = self.futures.take(pending.future) {
                let op = future.into_destroyed();
                self.deliver(op);
            }
        }
        if self.connected {
            self.push(&Command::Release {
                ty: ObjectType::Buffer,
                handle: buffer,
            });
        }
        Ok(())
    }

    pub fn release_bind_group(&mut self, bind_group: ObjectHandle) -> Result<(), ClientError> {
        if !self.bind_groups.remove(&bind_group) {
            return Err(ClientError::InvalidHandle);
        }
        self.bind_group_alloc.release(bind_group);
        if self.connected {
            self.push(&Command::Release {
                ty: ObjectType::BindGroup,
                handle: bind_group,
            });
        }
        Ok(())
    }

    /// Drops the device. Feature requests still pending on it resolve with a
    /// destroyed status; the handles of objects created under it stay valid
    /// until released individually (the server keeps its own references).
    pub fn release_device(&mut self, device: ObjectHandle) -> Result<(), ClientError> {
        self.devices
            .remove(&device)
            .ok_or(ClientError::InvalidHandle)?;
        self.device_alloc.release(device);
        for id in self.futures.pending_on_device(device) {
            if let Some(future) = self.futures.take(id) {
                let op = future.into_destroyed();
                self.deliver(op);
            }
        }
        if self.connected {
            self.push(&Command::Release {
                ty: ObjectType::Device,
                handle: device,
            });
        }
        Ok(())
    }

    /// Pushes the accumulated command stream to the transport as one message.
    pub fn flush(&mut self) -> Result<(), ClientError> {
        if !self.connected {
            return Err(ClientError::Disconnected);
        }
        if self.stream.is_empty() {
            return Ok(());
        }
        let message = std::mem::take(&mut self.stream);
        if let Err(err) = self.transport.send(&message) {
            warn!(error = %err, "transport send failed, disconnecting");
            self.disconnect();
            return Err(err.into());
        }
        Ok(())
    }

    /// Decodes and dispatches one message from the server's event stream.
    ///
    /// Spontaneous and legacy-async callbacks fire from inside this call.
    /// Any decode failure is protocol corruption: the client disconnects
    /// (resolving every outstanding future) and returns the error.
    pub fn handle_events(&mut self, message: &[u8]) -> Result<(), WireError> {
        if !self.connected {
            return Err(WireError::Disconnected);
        }
        let mut iter = RecordIter::new(message);
        while let Some(record) = iter.next() {
            let result = record
                .and_then(decode_event)
                .and_then(|event| self.dispatch_event(event));
            if let Err(err) = result {
                warn!(error = %err, "event stream corrupt, disconnecting");
                self.disconnect();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Delivers any of `ids` that are Ready in WaitAny mode, in request
    /// order, returning how many fired. The protocol is cooperatively
    /// single-threaded: nothing can become ready while the caller sits here,
    /// so an empty ready set returns 0 at once and `timeout` is only an upper
    /// bound honored trivially.
    pub fn wait_any(&mut self, ids: &[FutureId], _timeout: Duration) -> usize {
        let mut ready: Vec<FutureId> = self
            .futures
            .ready_ids(CallbackMode::WaitAny)
            .into_iter()
            .filter(|id| ids.contains(id))
            .collect();
        ready.sort();
        let mut delivered = 0;
        for id in ready {
            // A callback may disconnect or release objects, removing later
            // entries; take_ready fails closed on those.
            if let Some(op) = self.futures.take_ready(id, CallbackMode::WaitAny) {
                self.deliver(op);
                delivered += 1;
            }
        }
        delivered
    }

    /// Delivers every Ready ProcessEvents-mode future, in request order.
    pub fn process_events(&mut self) -> usize {
        let ready = self.futures.ready_ids(CallbackMode::ProcessEvents);
        let mut delivered = 0;
        for id in ready {
            if let Some(op) = self.futures.take_ready(id, CallbackMode::ProcessEvents) {
                self.deliver(op);
                delivered += 1;
            }
        }
        delivered
    }

    /// Severs the connection. Idempotent: the first call resolves every
    /// outstanding future to a terminal lost status through its registered
    /// callback — deferred modes deliver immediately too, since no further
    /// server interaction could ever make a poll succeed. Subsequent calls
    /// are no-ops. Afterwards, new calls fail locally without touching the
    /// transport; releases and unmaps still perform their local cleanup.
    pub fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        debug!("client disconnecting");
        self.connected = false;
        self.stream.clear();
        for future in self.futures.take_all() {
            let op = future.into_lost();
            self.deliver(op);
        }
    }

    fn push(&mut self, command: &Command) {
        push_record(&mut self.stream, &encode_command(command));
    }

    fn dispatch_event(&mut self, event: Event) -> Result<(), WireError> {
        match event {
            Event::BufferMapped {
                buffer,
                future,
                status,
                initial_data,
            } => self.on_buffer_mapped(buffer, future, status, &initial_data),
            Event::FeaturesEnumerated {
                device: _,
                future,
                features,
            } => {
                if self.futures.mode(future).is_none() {
                    // Completion raced a release/disconnect that already
                    // force-resolved the future. Expected, not an error.
                    trace!(future = future.0, "stale feature enumeration ignored");
                    return Ok(());
                }
                self.futures
                    .make_ready_features(future, FeaturesResponse::Ready(features));
                self.deliver_if_immediate(future);
                Ok(())
            }
            Event::UncapturedError {
                device,
                kind,
                message,
            } => {
                self.deliver_uncaptured_error(device, kind, &message);
                Ok(())
            }
        }
    }

    fn on_buffer_mapped(
        &mut self,
        buffer: ObjectHandle,
        future: FutureId,
        status: MapStatus,
        initial_data: &[u8],
    ) -> Result<(), WireError> {
        if self.futures.mode(future).is_none() {
            trace!(future = future.0, "stale map completion ignored");
            return Ok(());
        }
        let Some(record) = self.buffers.get_mut(&buffer) else {
            trace!(id = buffer.id, "map completion for released buffer ignored");
            return Ok(());
        };
        let Some(pending) = record.pending.as_ref() else {
            trace!(id = buffer.id, "map completion with no pending request ignored");
            return Ok(());
        };
        if pending.future != future {
            return Ok(());
        }
        let (mode, offset, size, override_status) = (
            pending.mode,
            pending.offset,
            pending.size,
            pending.override_status,
        );
        // A local unmap or release that outran the server wins over whatever
        // the server reports.
        let effective = override_status.unwrap_or(status);
        if effective == MapStatus::Success {
            match mode {
                MapMode::Read => {
                    let Some(read) = record.read_handle.as_mut() else {
                        return Err(WireError::UnexpectedEof);
                    };
                    read.apply_initial_data(initial_data)?;
                    record.map = MapState::MappedForRead { offset, size };
                }
                MapMode::Write => {
                    record.map = MapState::MappedForWrite { offset, size };
                }
            }
        } else {
            // The cycle is over; a transfer handle is never reused after a
            // failed step.
            record.read_handle = None;
            record.write_handle = None;
        }
        self.futures.make_ready_map(future, effective);
        self.deliver_if_immediate(future);
        Ok(())
    }

    /// Delivers a Ready future now unless its mode defers to an explicit
    /// poll.
    fn deliver_if_immediate(&mut self, future: FutureId) {
        let Some(mode) = self.futures.mode(future) else {
            return;
        };
        if mode.is_deferred() {
            return;
        }
        if let Some(op) = self.futures.take_ready(future, mode) {
            self.deliver(op);
        }
    }

    /// Single delivery path: the future record is already removed from the
    /// registry, so a callback that re-enters the client cannot observe or
    /// re-deliver it.
    fn deliver(&mut self, op: ReadyOp) {
        match op {
            ReadyOp::Map {
                buffer,
                callback,
                status,
            } => {
                // Only one map per buffer is ever in flight, so any pending
                // marker still on the record belongs to this future.
                if let Some(record) = self.buffers.get_mut(&buffer) {
                    record.pending = None;
                }
                callback(self, status);
            }
            ReadyOp::Features { callback, response } => callback(self, response),
        }
    }

    fn deliver_uncaptured_error(&mut self, device: ObjectHandle, kind: ErrorKind, message: &str) {
        let Some(record) = self.devices.get_mut(&device) else {
            trace!(id = device.id, "error for released device ignored");
            return;
        };
        // Taken out while firing, put back after unless replaced.
        let Some(mut callback) = record.error_callback.take() else {
            warn!(id = device.id, ?kind, message, "uncaptured device error");
            return;
        };
        callback(kind, message);
        if let Some(record) = self.devices.get_mut(&device) {
            if record.error_callback.is_none() {
                record.error_callback = Some(callback);
            }
        }
    }

    /// Reflects a client-detected validation failure through the server's
    /// error channel. The malformed call itself is never sent; the error
    /// callback fires once, off the echoed `UncapturedError` event, so both
    /// sides observe the same single error stream.
    fn report_local_validation(&mut self, device: ObjectHandle, message: &'static str) {
        debug!(id = device.id, message, "local validation failure");
        self.push(&Command::DeviceInjectError {
            device,
            kind: ErrorKind::Validation,
            message: message.to_owned(),
        });
    }
}

fn validate_buffer_descriptor(desc: &BufferDescriptor) -> Option<&'static str> {
    if desc.usage.is_empty() {
        return Some("buffer usage may not be empty");
    }
    if desc.mapped_at_creation && desc.size == 0 {
        return Some("mapped-at-creation buffer may not be zero-sized");
    }
    None
}

/// Translates an absolute `[offset, offset + size)` request into an index
/// range relative to the mapped span, failing closed on any overflow or
/// out-of-span access.
fn checked_subrange(
    offset: u64,
    size: u64,
    map_offset: u64,
    map_size: u64,
) -> Result<std::ops::Range<usize>, ClientError> {
    let end = offset
        .checked_add(size)
        .ok_or(ClientError::Validation("range overflows"))?;
    let map_end = map_offset
        .checked_add(map_size)
        .ok_or(ClientError::Validation("range overflows"))?;
    if offset < map_offset || end > map_end {
        return Err(ClientError::Validation("range outside mapped span"));
    }
    let rel_start = usize::try_from(offset - map_offset)
        .map_err(|_| ClientError::Validation("range outside mapped span"))?;
    let rel_len =
        usize::try_from(size).map_err(|_| ClientError::Validation("range outside mapped span"))?;
    Ok(rel_start..rel_start + rel_len)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use tether_wire::transport::MemoryPipe;

    use super::*;
    use crate::transfer::InlineTransfer;

    fn client() -> Client {
        let (pipe, _rx) = MemoryPipe::pair();
        Client::connect(Box::new(pipe), Box::new(InlineTransfer))
    }

    fn plain_desc(size: u64, usage: BufferUsages) -> BufferDescriptor {
        BufferDescriptor {
            label: None,
            size,
            usage,
            mapped_at_creation: false,
            extensions: Vec::new(),
        }
    }

    #[test]
    fn invalid_descriptor_fails_before_serialization() {
        let mut c = client();
        let dev = c.reserve_device();

        let bad = plain_desc(16, BufferUsages::empty());
        assert!(matches!(
            c.create_buffer(dev, &bad),
            Err(ClientError::Validation(_))
        ));
        // The handle space is untouched; the next create gets a fresh record.
        let ok = c.create_buffer(dev, &plain_desc(16, BufferUsages::MAP_READ));
        assert!(ok.is_ok());
    }

    #[test]
    fn second_map_while_pending_fails_without_touching_the_wire() {
        let mut c = client();
        let dev = c.reserve_device();
        let buf = c
            .create_buffer(dev, &plain_desc(16, BufferUsages::MAP_READ))
            .unwrap();
        let statuses = Rc::new(RefCell::new(Vec::new()));

        let sink = Rc::clone(&statuses);
        c.buffer_map_async(
            buf,
            MapMode::Read,
            0,
            16,
            CallbackMode::Spontaneous,
            Box::new(move |_, s| sink.borrow_mut().push(s)),
        )
        .unwrap();
        assert!(statuses.borrow().is_empty());

        let sink = Rc::clone(&statuses);
        c.buffer_map_async(
            buf,
            MapMode::Read,
            0,
            16,
            CallbackMode::Spontaneous,
            Box::new(move |_, s| sink.borrow_mut().push(s)),
        )
        .unwrap();
        assert_eq!(*statuses.borrow(), vec![MapStatus::Error]);
    }

    #[test]
    fn map_on_disconnected_client_fires_lost_immediately() {
        let mut c = client();
        let dev = c.reserve_device();
        let buf = c
            .create_buffer(dev, &plain_desc(8, BufferUsages::MAP_READ))
            .unwrap();
        c.disconnect();
        c.disconnect(); // idempotent

        let statuses = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&statuses);
        c.buffer_map_async(
            buf,
            MapMode::Read,
            0,
            8,
            CallbackMode::WaitAny,
            Box::new(move |_, s| sink.borrow_mut().push(s)),
        )
        .unwrap();
        assert_eq!(*statuses.borrow(), vec![MapStatus::DeviceLost]);
    }

    #[test]
    fn mapped_at_creation_span_is_writable_immediately() {
        let mut c = client();
        let dev = c.reserve_device();
        let desc = BufferDescriptor {
            label: None,
            size: 4,
            usage: BufferUsages::COPY_SRC,
            mapped_at_creation: true,
            extensions: Vec::new(),
        };
        let buf = c.create_buffer(dev, &desc).unwrap();
        c.buffer_mapped_range_mut(buf, 0, 4)
            .unwrap()
            .copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(c.buffer_mapped_range(buf, 1, 2).unwrap(), &[2, 3]);
        c.buffer_unmap(buf).unwrap();
        assert!(c.buffer_mapped_range(buf, 0, 4).is_err());
    }
}
