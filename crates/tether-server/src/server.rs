//! Server connection: decode, validate, replay, reply.
//!
//! `handle_commands` walks one flushed message from the client and executes
//! every record synchronously, in order, against the wrapped [`Backend`].
//! Nothing arriving off the wire is trusted: a handle that fails to resolve
//! in a command's primary position, a malformed record, or a bad transfer
//! payload is protocol corruption and severs the connection. A *cross
//! referenced* handle inside a descriptor that is stale or belongs to a
//! different device is a race a well-behaved client can produce (a release
//! pipelined behind a create), so the gateway converts it into an injected
//! validation error on the device error channel and records an error
//! placeholder under the result handle instead of rejecting the command.

use tracing::{debug, trace, warn};

use tether_wire::transport::{Transport, TransportError};
use tether_wire::{
    decode_command, encode_event, push_record, BufferDescriptor, BufferUsages, Command, ErrorKind,
    Event, FutureId, MapMode, MapStatus, ObjectHandle, ObjectType, RecordIter, WireError,
};

use crate::backend::{Backend, BackendBindGroupId, BackendBufferId, BackendDeviceId, ResolvedBinding};
use crate::table::ObjectTable;
use crate::transfer::{MemoryTransfer, WriteHandle};

/// Local server failures (not wire corruption).
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("connection is disconnected")]
    Disconnected,

    #[error("transport failure")]
    Transport(#[from] TransportError),
}

struct DeviceRecord {
    backend: BackendDeviceId,
    /// Injected devices are externally owned; release and disconnect must
    /// not destroy them in the backend.
    injected: bool,
}

enum MapCycle {
    Read,
    Write {
        offset: u64,
        size: u64,
        handle: Box<dyn WriteHandle>,
    },
}

struct BufferRecord {
    device: ObjectHandle,
    /// `None` marks an error placeholder: creation failed (backend error or
    /// gateway rejection), but the handle must stay well-formed so a
    /// pipelined `Release` on it is not corruption.
    backend: Option<BackendBufferId>,
    size: u64,
    usage: BufferUsages,
    map: Option<MapCycle>,
}

struct BindGroupRecord {
    backend: Option<BackendBindGroupId>,
}

/// Server half of one connection.
pub struct Server<B: Backend> {
    backend: B,
    transport: Box<dyn Transport>,
    transfer: Box<dyn MemoryTransfer>,
    connected: bool,
    /// Event records accumulated since the last flush.
    events: Vec<u8>,
    devices: ObjectTable<DeviceRecord>,
    buffers: ObjectTable<BufferRecord>,
    bind_groups: ObjectTable<BindGroupRecord>,
}

impl<B: Backend> Server<B> {
    pub fn new(
        backend: B,
        transport: Box<dyn Transport>,
        transfer: Box<dyn MemoryTransfer>,
    ) -> Self {
        Self {
            backend,
            transport,
            transfer,
            connected: true,
            events: Vec::new(),
            devices: ObjectTable::new(),
            buffers: ObjectTable::new(),
            bind_groups: ObjectTable::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Binds a client-reserved handle to a pre-existing backend device (the
    /// interop path). Fails if the id is already live. The backend object
    /// stays externally owned.
    pub fn inject_device(&mut self, handle: ObjectHandle, backend: BackendDeviceId) -> bool {
        let inserted = self.devices.insert(
            handle,
            DeviceRecord {
                backend,
                injected: true,
            },
        );
        if inserted {
            trace!(id = handle.id, generation = handle.generation, "device injected");
        }
        inserted
    }

    /// Decodes and executes one message from the client's command stream.
    ///
    /// Commands apply in FIFO order on the caller's thread. Any decode or
    /// primary-handle failure is corruption: the server disconnects and
    /// returns the error.
    pub fn handle_commands(&mut self, message: &[u8]) -> Result<(), WireError> {
        if !self.connected {
            return Err(WireError::Disconnected);
        }
        let mut iter = RecordIter::new(message);
        while let Some(record) = iter.next() {
            let result = record
                .and_then(decode_command)
                .and_then(|command| self.exec(command));
            if let Err(err) = result {
                warn!(error = %err, "command stream corrupt, disconnecting");
                self.disconnect();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Pushes the accumulated event stream to the transport as one message.
    pub fn flush(&mut self) -> Result<(), ServerError> {
        if !self.connected {
            return Err(ServerError::Disconnected);
        }
        if self.events.is_empty() {
            return Ok(());
        }
        let message = std::mem::take(&mut self.events);
        if let Err(err) = self.transport.send(&message) {
            warn!(error = %err, "transport send failed, disconnecting");
            self.disconnect();
            return Err(err.into());
        }
        Ok(())
    }

    /// Tears the connection down. Idempotent: the first call vacates every
    /// table and destroys each owned backend object exactly once (injected
    /// devices excepted); subsequent calls are no-ops. Afterwards
    /// `handle_commands` refuses input.
    pub fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        debug!("server disconnecting");
        self.connected = false;
        self.events.clear();
        for record in self.bind_groups.drain() {
            if let Some(id) = record.backend {
                self.backend.destroy_bind_group(id);
            }
        }
        for record in self.buffers.drain() {
            if let Some(id) = record.backend {
                self.backend.destroy_buffer(id);
            }
        }
        for record in self.devices.drain() {
            if !record.injected {
                self.backend.destroy_device(record.backend);
            }
        }
    }

    fn exec(&mut self, command: Command) -> Result<(), WireError> {
        match command {
            Command::DeviceCreateBuffer {
                device,
                result,
                desc,
                write_handle_create,
            } => self.exec_create_buffer(device, result, desc, write_handle_create),
            Command::DeviceCreateBindGroup {
                device,
                result,
                entries,
            } => self.exec_create_bind_group(device, result, &entries),
            Command::DeviceRequestFeatures { device, future } => {
                let record = self.resolve_device(device)?;
                let features = self.backend.enumerate_features(record);
                self.push_event(&Event::FeaturesEnumerated {
                    device,
                    future,
                    features,
                });
                Ok(())
            }
            Command::DeviceInjectError {
                device,
                kind,
                message,
            } => {
                self.resolve_device(device)?;
                // Client-detected failure reflected back out unchanged.
                self.push_event(&Event::UncapturedError {
                    device,
                    kind,
                    message,
                });
                Ok(())
            }
            Command::BufferMapAsync {
                buffer,
                future,
                mode,
                offset,
                size,
                handle_create,
            } => self.exec_map_async(buffer, future, mode, offset, size, &handle_create),
            Command::BufferUpdateMappedData {
                buffer,
                offset,
                size,
                flush_payload,
            } => self.exec_update_mapped(buffer, offset, size, &flush_payload),
            Command::BufferUnmap { buffer } => {
                let record = self
                    .buffers
                    .get_mut(buffer)
                    .ok_or_else(|| stale(ObjectType::Buffer, buffer))?;
                record.map = None;
                Ok(())
            }
            Command::Release { ty, handle } => self.exec_release(ty, handle),
        }
    }

    fn exec_create_buffer(
        &mut self,
        device: ObjectHandle,
        result: ObjectHandle,
        desc: BufferDescriptor,
        write_handle_create: Option<Vec<u8>>,
    ) -> Result<(), WireError> {
        let backend_device = self.resolve_device(device)?;
        if write_handle_create.is_some() != desc.mapped_at_creation {
            // The client serializes the two together; a mismatch cannot come
            // from a healthy peer.
            return Err(WireError::UnexpectedEof);
        }

        let backend = match self.backend.create_buffer(backend_device, desc.size, desc.usage) {
            Ok(id) => Some(id),
            Err(err) => {
                self.inject_error(device, err.kind(), &err.to_string());
                None
            }
        };
        // Parked even when the backend call failed: the client will still
        // flush and unmap its side of the cycle, and those records must stay
        // well-formed.
        let map = match write_handle_create {
            Some(create) => {
                let handle = self
                    .transfer
                    .deserialize_write_handle(&create)
                    .ok_or(WireError::UnexpectedEof)?;
                if handle.size() != desc.size {
                    return Err(WireError::UnexpectedEof);
                }
                Some(MapCycle::Write {
                    offset: 0,
                    size: desc.size,
                    handle,
                })
            }
            None => None,
        };
        let record = BufferRecord {
            device,
            backend,
            size: desc.size,
            usage: desc.usage,
            map,
        };
        if !self.buffers.insert(result, record) {
            return Err(stale(ObjectType::Buffer, result));
        }
        Ok(())
    }

    /// The validation gateway: the backend cannot cheaply check, from its own
    /// opaque ids, that every buffer bound into a group came from the group's
    /// device — opaque ids from different devices look alike. Checked here,
    /// where the handle tables still know the provenance.
    fn exec_create_bind_group(
        &mut self,
        device: ObjectHandle,
        result: ObjectHandle,
        entries: &[tether_wire::BindGroupEntry],
    ) -> Result<(), WireError> {
        let backend_device = self.resolve_device(device)?;

        let mut resolved = Vec::with_capacity(entries.len());
        let mut violation: Option<&'static str> = None;
        for entry in entries {
            let Some(record) = self.buffers.get(entry.buffer) else {
                violation = Some("bind group entry references a destroyed buffer");
                break;
            };
            if record.device != device {
                violation = Some("bind group entry buffer belongs to a different device");
                break;
            }
            let Some(backend) = record.backend else {
                violation = Some("bind group entry references an errored buffer");
                break;
            };
            resolved.push(ResolvedBinding {
                binding: entry.binding,
                buffer: backend,
                offset: entry.offset,
                size: entry.size,
            });
        }

        let backend = if let Some(message) = violation {
            self.inject_error(device, ErrorKind::Validation, message);
            None
        } else {
            match self.backend.create_bind_group(backend_device, &resolved) {
                Ok(id) => Some(id),
                Err(err) => {
                    self.inject_error(device, err.kind(), &err.to_string());
                    None
                }
            }
        };
        if !self.bind_groups.insert(result, BindGroupRecord { backend }) {
            return Err(stale(ObjectType::BindGroup, result));
        }
        Ok(())
    }

    fn exec_map_async(
        &mut self,
        buffer: ObjectHandle,
        future: FutureId,
        mode: MapMode,
        offset: u64,
        size: u64,
        handle_create: &[u8],
    ) -> Result<(), WireError> {
        let record = self
            .buffers
            .get(buffer)
            .ok_or_else(|| stale(ObjectType::Buffer, buffer))?;

        // Recoverable request-level failures: the reply carries an Error
        // status, the connection stays up.
        let usage_ok = match mode {
            MapMode::Read => record.usage.contains(BufferUsages::MAP_READ),
            MapMode::Write => record.usage.contains(BufferUsages::MAP_WRITE),
        };
        let in_bounds = offset
            .checked_add(size)
            .is_some_and(|end| end <= record.size);
        let backend = match record.backend {
            Some(id) if record.map.is_none() && usage_ok && in_bounds => id,
            _ => {
                self.push_event(&Event::BufferMapped {
                    buffer,
                    future,
                    status: MapStatus::Error,
                    initial_data: Vec::new(),
                });
                return Ok(());
            }
        };

        match mode {
            MapMode::Read => {
                let mut handle = self
                    .transfer
                    .deserialize_read_handle(handle_create)
                    .ok_or(WireError::UnexpectedEof)?;
                if handle.size() != size {
                    return Err(WireError::UnexpectedEof);
                }
                let contents = match self.backend.read_buffer(backend, offset, size) {
                    Ok(contents) => contents,
                    Err(err) => {
                        // Failed step: the handle is dropped here and never
                        // reused; the client sees the failure status.
                        trace!(error = %err, "map-for-read backend failure");
                        self.push_event(&Event::BufferMapped {
                            buffer,
                            future,
                            status: MapStatus::Error,
                            initial_data: Vec::new(),
                        });
                        return Ok(());
                    }
                };
                let initial_data = handle.serialize_initial_data(&contents);
                if let Some(record) = self.buffers.get_mut(buffer) {
                    record.map = Some(MapCycle::Read);
                }
                self.push_event(&Event::BufferMapped {
                    buffer,
                    future,
                    status: MapStatus::Success,
                    initial_data,
                });
            }
            MapMode::Write => {
                let handle = self
                    .transfer
                    .deserialize_write_handle(handle_create)
                    .ok_or(WireError::UnexpectedEof)?;
                if handle.size() != size {
                    return Err(WireError::UnexpectedEof);
                }
                if let Some(record) = self.buffers.get_mut(buffer) {
                    record.map = Some(MapCycle::Write {
                        offset,
                        size,
                        handle,
                    });
                }
                self.push_event(&Event::BufferMapped {
                    buffer,
                    future,
                    status: MapStatus::Success,
                    initial_data: Vec::new(),
                });
            }
        }
        Ok(())
    }

    fn exec_update_mapped(
        &mut self,
        buffer: ObjectHandle,
        offset: u64,
        size: u64,
        flush_payload: &[u8],
    ) -> Result<(), WireError> {
        let record = self
            .buffers
            .get_mut(buffer)
            .ok_or_else(|| stale(ObjectType::Buffer, buffer))?;
        let device = record.device;
        let backend = record.backend;

        // The stream is FIFO, so a flush that does not line up with the
        // currently parked write span cannot come from a healthy client.
        let applied = match record.map.as_mut() {
            Some(MapCycle::Write {
                offset: map_offset,
                size: map_size,
                handle,
            }) if *map_offset == offset && *map_size == size => {
                handle.deserialize_flush(flush_payload)
            }
            _ => return Err(WireError::UnexpectedEof),
        };

        let bytes = match applied {
            Ok(bytes) => bytes,
            Err(err) => {
                // Failed step: destroy the handle, report, keep the
                // connection. Nothing was applied.
                trace!(error = %err, "flush payload rejected by transfer handle");
                record.map = None;
                self.inject_error(
                    device,
                    ErrorKind::Validation,
                    "mapped-data flush payload was malformed",
                );
                return Ok(());
            }
        };
        if let Some(backend) = backend {
            // Single call into the wrapped API: the whole span lands or none
            // of it does.
            if let Err(err) = self.backend.write_buffer(backend, offset, &bytes) {
                self.inject_error(device, err.kind(), &err.to_string());
            }
        }
        Ok(())
    }

    fn exec_release(&mut self, ty: ObjectType, handle: ObjectHandle) -> Result<(), WireError> {
        match ty {
            ObjectType::Device => match self.devices.release(handle) {
                None => Err(stale(ObjectType::Device, handle)),
                Some(None) => Ok(()),
                Some(Some(record)) => {
                    if !record.injected {
                        self.backend.destroy_device(record.backend);
                    }
                    Ok(())
                }
            },
            ObjectType::Buffer => match self.buffers.release(handle) {
                None => Err(stale(ObjectType::Buffer, handle)),
                Some(None) => Ok(()),
                Some(Some(record)) => {
                    if let Some(id) = record.backend {
                        self.backend.destroy_buffer(id);
                    }
                    Ok(())
                }
            },
            ObjectType::BindGroup => match self.bind_groups.release(handle) {
                None => Err(stale(ObjectType::BindGroup, handle)),
                Some(None) => Ok(()),
                Some(Some(record)) => {
                    if let Some(id) = record.backend {
                        self.backend.destroy_bind_group(id);
                    }
                    Ok(())
                }
            },
        }
    }

    /// Resolves a command's primary device handle; failure here is
    /// corruption, not a recoverable error.
    fn resolve_device(&self, device: ObjectHandle) -> Result<BackendDeviceId, WireError> {
        self.devices
            .get(device)
            .map(|record| record.backend)
            .ok_or_else(|| stale(ObjectType::Device, device))
    }

    /// Manufactures a one-shot error on the device's normal error channel.
    fn inject_error(&mut self, device: ObjectHandle, kind: ErrorKind, message: &str) {
        warn!(id = device.id, ?kind, message, "injected device error");
        self.push_event(&Event::UncapturedError {
            device,
            kind,
            message: message.to_owned(),
        });
    }

    fn push_event(&mut self, event: &Event) {
        push_record(&mut self.events, &encode_event(event));
    }
}

fn stale(ty: ObjectType, handle: ObjectHandle) -> WireError {
    WireError::StaleHandle {
        ty,
        id: handle.id,
        generation: handle.generation,
    }
}
