//! Binary command/event protocol.
//!
//! Deliberately small, stable, little-endian format:
//! - each record is `u16 tag` + fixed fields + variable-length blocks
//! - a flush produces one transport message of length-prefixed records
//! - decoding is strictly bounds-checked; any malformed length, unknown tag,
//!   or trailing garbage aborts the record and is treated as protocol
//!   corruption by the caller (the stream framing can no longer be trusted)

use bitflags::bitflags;
use thiserror::Error;

use crate::extension::{decode_extension_chain, encode_extension_chain, BufferExtension};
use crate::handle::{FutureId, ObjectHandle, ObjectType};

/// Defensive maximum size (bytes) of a single record.
pub const MAX_RECORD_BYTES: usize = 1 << 20; // 1 MiB

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of record")]
    UnexpectedEof,

    #[error("unknown record tag {0:#06x}")]
    UnknownTag(u16),

    #[error("invalid enum value")]
    InvalidEnum,

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("record length {len} exceeds cap of {max} bytes")]
    OversizedRecord { len: usize, max: usize },

    #[error("trailing bytes after record payload")]
    TrailingBytes,

    #[error("unknown mandatory extension stype {0:#06x}")]
    UnknownMandatoryExtension(u16),

    #[error("extension chain exceeds maximum link count")]
    ExtensionChainTooLong,

    #[error("stale or unknown {ty:?} handle {id}:{generation}")]
    StaleHandle {
        ty: ObjectType,
        id: u32,
        generation: u32,
    },

    #[error("object id {0} out of range")]
    ObjectIdOutOfRange(u32),

    #[error("connection is disconnected")]
    Disconnected,
}

bitflags! {
    /// Buffer usage flags carried in [`BufferDescriptor`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BufferUsages: u32 {
        const MAP_READ = 1 << 0;
        const MAP_WRITE = 1 << 1;
        const COPY_SRC = 1 << 2;
        const COPY_DST = 1 << 3;
        const UNIFORM = 1 << 4;
        const STORAGE = 1 << 5;
    }
}

/// Direction of a buffer map operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapMode {
    Read,
    Write,
}

impl MapMode {
    fn to_u8(self) -> u8 {
        match self {
            MapMode::Read => 0,
            MapMode::Write => 1,
        }
    }

    fn from_u8(v: u8) -> Result<Self, WireError> {
        Ok(match v {
            0 => MapMode::Read,
            1 => MapMode::Write,
            _ => return Err(WireError::InvalidEnum),
        })
    }
}

/// Terminal status of a map request. Exactly one of these reaches the
/// registered callback, whatever the failure category.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapStatus {
    Success,
    /// Recoverable API-level failure (validation, OOM, transfer failure).
    Error,
    /// The request was overtaken by an unmap/remap and its outcome is moot.
    Unknown,
    /// The connection was severed before completion.
    DeviceLost,
    DestroyedBeforeCallback,
    UnmappedBeforeCallback,
}

impl MapStatus {
    fn to_u8(self) -> u8 {
        match self {
            MapStatus::Success => 0,
            MapStatus::Error => 1,
            MapStatus::Unknown => 2,
            MapStatus::DeviceLost => 3,
            MapStatus::DestroyedBeforeCallback => 4,
            MapStatus::UnmappedBeforeCallback => 5,
        }
    }

    fn from_u8(v: u8) -> Result<Self, WireError> {
        Ok(match v {
            0 => MapStatus::Success,
            1 => MapStatus::Error,
            2 => MapStatus::Unknown,
            3 => MapStatus::DeviceLost,
            4 => MapStatus::DestroyedBeforeCallback,
            5 => MapStatus::UnmappedBeforeCallback,
            _ => return Err(WireError::InvalidEnum),
        })
    }
}

/// Kind of an error reported through the device error channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    OutOfMemory,
    Internal,
}

impl ErrorKind {
    fn to_u8(self) -> u8 {
        match self {
            ErrorKind::Validation => 0,
            ErrorKind::OutOfMemory => 1,
            ErrorKind::Internal => 2,
        }
    }

    fn from_u8(v: u8) -> Result<Self, WireError> {
        Ok(match v {
            0 => ErrorKind::Validation,
            1 => ErrorKind::OutOfMemory,
            2 => ErrorKind::Internal,
            _ => return Err(WireError::InvalidEnum),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsages,
    pub mapped_at_creation: bool,
    pub extensions: Vec<BufferExtension>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindGroupEntry {
    pub binding: u32,
    pub buffer: ObjectHandle,
    pub offset: u64,
    pub size: u64,
}

/// Client -> server records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Create a buffer under `result`, a handle the client allocated eagerly
    /// so the return value is usable before the server confirms anything.
    /// Buffers mapped at creation carry the creation payload of their
    /// companion write handle.
    DeviceCreateBuffer {
        device: ObjectHandle,
        result: ObjectHandle,
        desc: BufferDescriptor,
        write_handle_create: Option<Vec<u8>>,
    },

    DeviceCreateBindGroup {
        device: ObjectHandle,
        result: ObjectHandle,
        entries: Vec<BindGroupEntry>,
    },

    /// Ask for the device's dynamic feature list. Answered by
    /// [`Event::FeaturesEnumerated`] carrying `future`.
    DeviceRequestFeatures {
        device: ObjectHandle,
        future: FutureId,
    },

    /// Client-detected validation failure, reflected back through the
    /// server's normal error channel so both sides observe one error stream.
    DeviceInjectError {
        device: ObjectHandle,
        kind: ErrorKind,
        message: String,
    },

    /// Request a map of `[offset, offset + size)`. `handle_create` is the
    /// serialized creation payload of the companion transfer handle.
    BufferMapAsync {
        buffer: ObjectHandle,
        future: FutureId,
        mode: MapMode,
        offset: u64,
        size: u64,
        handle_create: Vec<u8>,
    },

    /// Flush of a write-mapped range, sent just before [`Command::BufferUnmap`].
    BufferUpdateMappedData {
        buffer: ObjectHandle,
        offset: u64,
        size: u64,
        flush_payload: Vec<u8>,
    },

    BufferUnmap { buffer: ObjectHandle },

    /// Drop one strong reference to `handle`.
    Release { ty: ObjectType, handle: ObjectHandle },
}

/// Server -> client records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Completion of [`Command::BufferMapAsync`]. For successful read maps,
    /// `initial_data` is the read handle's initialize payload.
    BufferMapped {
        buffer: ObjectHandle,
        future: FutureId,
        status: MapStatus,
        initial_data: Vec<u8>,
    },

    /// Dynamic-length feature list; the count is unknown at compile time.
    FeaturesEnumerated {
        device: ObjectHandle,
        future: FutureId,
        features: Vec<u32>,
    },

    /// API-level or injected error, passed through unchanged.
    UncapturedError {
        device: ObjectHandle,
        kind: ErrorKind,
        message: String,
    },
}

const CMD_TAG_DEVICE_CREATE_BUFFER: u16 = 0x0100;
const CMD_TAG_DEVICE_CREATE_BIND_GROUP: u16 = 0x0101;
const CMD_TAG_DEVICE_REQUEST_FEATURES: u16 = 0x0102;
const CMD_TAG_DEVICE_INJECT_ERROR: u16 = 0x0103;
const CMD_TAG_BUFFER_MAP_ASYNC: u16 = 0x0200;
const CMD_TAG_BUFFER_UPDATE_MAPPED: u16 = 0x0201;
const CMD_TAG_BUFFER_UNMAP: u16 = 0x0202;
const CMD_TAG_RELEASE: u16 = 0x0300;

const EVT_TAG_BUFFER_MAPPED: u16 = 0x1100;
const EVT_TAG_FEATURES_ENUMERATED: u16 = 0x1200;
const EVT_TAG_UNCAPTURED_ERROR: u16 = 0x1300;

pub fn encode_command(cmd: &Command) -> Vec<u8> {
    let mut out = Vec::new();
    encode_command_into(cmd, &mut out);
    out
}

pub fn encode_command_into(cmd: &Command, out: &mut Vec<u8>) {
    match cmd {
        Command::DeviceCreateBuffer {
            device,
            result,
            desc,
            write_handle_create,
        } => {
            push_u16(out, CMD_TAG_DEVICE_CREATE_BUFFER);
            push_handle(out, *device);
            push_handle(out, *result);
            encode_buffer_descriptor(out, desc);
            push_opt_blob(out, write_handle_create.as_deref());
        }
        Command::DeviceCreateBindGroup {
            device,
            result,
            entries,
        } => {
            push_u16(out, CMD_TAG_DEVICE_CREATE_BIND_GROUP);
            push_handle(out, *device);
            push_handle(out, *result);
            push_u32(out, entries.len() as u32);
            for e in entries {
                push_u32(out, e.binding);
                push_handle(out, e.buffer);
                push_u64(out, e.offset);
                push_u64(out, e.size);
            }
        }
        Command::DeviceRequestFeatures { device, future } => {
            push_u16(out, CMD_TAG_DEVICE_REQUEST_FEATURES);
            push_handle(out, *device);
            push_u64(out, future.0);
        }
        Command::DeviceInjectError {
            device,
            kind,
            message,
        } => {
            push_u16(out, CMD_TAG_DEVICE_INJECT_ERROR);
            push_handle(out, *device);
            out.push(kind.to_u8());
            push_str(out, message);
        }
        Command::BufferMapAsync {
            buffer,
            future,
            mode,
            offset,
            size,
            handle_create,
        } => {
            push_u16(out, CMD_TAG_BUFFER_MAP_ASYNC);
            push_handle(out, *buffer);
            push_u64(out, future.0);
            out.push(mode.to_u8());
            push_u64(out, *offset);
            push_u64(out, *size);
            push_blob(out, handle_create);
        }
        Command::BufferUpdateMappedData {
            buffer,
            offset,
            size,
            flush_payload,
        } => {
            push_u16(out, CMD_TAG_BUFFER_UPDATE_MAPPED);
            push_handle(out, *buffer);
            push_u64(out, *offset);
            push_u64(out, *size);
            push_blob(out, flush_payload);
        }
        Command::BufferUnmap { buffer } => {
            push_u16(out, CMD_TAG_BUFFER_UNMAP);
            push_handle(out, *buffer);
        }
        Command::Release { ty, handle } => {
            push_u16(out, CMD_TAG_RELEASE);
            out.push(ty.to_u8());
            push_handle(out, *handle);
        }
    }
}

pub fn encode_event(evt: &Event) -> Vec<u8> {
    let mut out = Vec::new();
    encode_event_into(evt, &mut out);
    out
}

pub fn encode_event_into(evt: &Event, out: &mut Vec<u8>) {
    match evt {
        Event::BufferMapped {
            buffer,
            future,
            status,
            initial_data,
        } => {
            push_u16(out, EVT_TAG_BUFFER_MAPPED);
            push_handle(out, *buffer);
            push_u64(out, future.0);
            out.push(status.to_u8());
            push_blob(out, initial_data);
        }
        Event::FeaturesEnumerated {
            device,
            future,
            features,
        } => {
            push_u16(out, EVT_TAG_FEATURES_ENUMERATED);
            push_handle(out, *device);
            push_u64(out, future.0);
            push_u32(out, features.len() as u32);
            for f in features {
                push_u32(out, *f);
            }
        }
        Event::UncapturedError {
            device,
            kind,
            message,
        } => {
            push_u16(out, EVT_TAG_UNCAPTURED_ERROR);
            push_handle(out, *device);
            out.push(kind.to_u8());
            push_str(out, message);
        }
    }
}

pub fn decode_command(bytes: &[u8]) -> Result<Command, WireError> {
    if bytes.len() > MAX_RECORD_BYTES {
        return Err(WireError::OversizedRecord {
            len: bytes.len(),
            max: MAX_RECORD_BYTES,
        });
    }
    let mut r = Reader::new(bytes);
    let tag = r.read_u16()?;
    let cmd = match tag {
        CMD_TAG_DEVICE_CREATE_BUFFER => {
            let device = r.read_handle()?;
            let result = r.read_handle()?;
            let desc = decode_buffer_descriptor(&mut r)?;
            let write_handle_create = r.read_opt_blob()?;
            Command::DeviceCreateBuffer {
                device,
                result,
                desc,
                write_handle_create,
            }
        }
        CMD_TAG_DEVICE_CREATE_BIND_GROUP => {
            let device = r.read_handle()?;
            let result = r.read_handle()?;
            let count = r.read_u32()? as usize;
            let mut entries = Vec::with_capacity(count.min(r.remaining() / 24 + 1));
            for _ in 0..count {
                entries.push(BindGroupEntry {
                    binding: r.read_u32()?,
                    buffer: r.read_handle()?,
                    offset: r.read_u64()?,
                    size: r.read_u64()?,
                });
            }
            Command::DeviceCreateBindGroup {
                device,
                result,
                entries,
            }
        }
        CMD_TAG_DEVICE_REQUEST_FEATURES => Command::DeviceRequestFeatures {
            device: r.read_handle()?,
            future: FutureId(r.read_u64()?),
        },
        CMD_TAG_DEVICE_INJECT_ERROR => Command::DeviceInjectError {
            device: r.read_handle()?,
            kind: ErrorKind::from_u8(r.read_u8()?)?,
            message: r.read_string()?,
        },
        CMD_TAG_BUFFER_MAP_ASYNC => Command::BufferMapAsync {
            buffer: r.read_handle()?,
            future: FutureId(r.read_u64()?),
            mode: MapMode::from_u8(r.read_u8()?)?,
            offset: r.read_u64()?,
            size: r.read_u64()?,
            handle_create: r.read_blob()?.to_vec(),
        },
        CMD_TAG_BUFFER_UPDATE_MAPPED => Command::BufferUpdateMappedData {
            buffer: r.read_handle()?,
            offset: r.read_u64()?,
            size: r.read_u64()?,
            flush_payload: r.read_blob()?.to_vec(),
        },
        CMD_TAG_BUFFER_UNMAP => Command::BufferUnmap {
            buffer: r.read_handle()?,
        },
        CMD_TAG_RELEASE => Command::Release {
            ty: ObjectType::from_u8(r.read_u8()?).ok_or(WireError::InvalidEnum)?,
            handle: r.read_handle()?,
        },
        other => return Err(WireError::UnknownTag(other)),
    };
    if r.remaining() != 0 {
        return Err(WireError::TrailingBytes);
    }
    Ok(cmd)
}

pub fn decode_event(bytes: &[u8]) -> Result<Event, WireError> {
    if bytes.len() > MAX_RECORD_BYTES {
        return Err(WireError::OversizedRecord {
            len: bytes.len(),
            max: MAX_RECORD_BYTES,
        });
    }
    let mut r = Reader::new(bytes);
    let tag = r.read_u16()?;
    let evt = match tag {
        EVT_TAG_BUFFER_MAPPED => Event::BufferMapped {
            buffer: r.read_handle()?,
            future: FutureId(r.read_u64()?),
            status: MapStatus::from_u8(r.read_u8()?)?,
            initial_data: r.read_blob()?.to_vec(),
        },
        EVT_TAG_FEATURES_ENUMERATED => {
            let device = r.read_handle()?;
            let future = FutureId(r.read_u64()?);
            let count = r.read_u32()? as usize;
            let mut features = Vec::with_capacity(count.min(r.remaining() / 4 + 1));
            for _ in 0..count {
                features.push(r.read_u32()?);
            }
            Event::FeaturesEnumerated {
                device,
                future,
                features,
            }
        }
        EVT_TAG_UNCAPTURED_ERROR => Event::UncapturedError {
            device: r.read_handle()?,
            kind: ErrorKind::from_u8(r.read_u8()?)?,
            message: r.read_string()?,
        },
        other => return Err(WireError::UnknownTag(other)),
    };
    if r.remaining() != 0 {
        return Err(WireError::TrailingBytes);
    }
    Ok(evt)
}

fn encode_buffer_descriptor(out: &mut Vec<u8>, desc: &BufferDescriptor) {
    match &desc.label {
        Some(label) => {
            out.push(1);
            push_str(out, label);
        }
        None => out.push(0),
    }
    push_u64(out, desc.size);
    push_u32(out, desc.usage.bits());
    out.push(desc.mapped_at_creation as u8);
    encode_extension_chain(out, &desc.extensions);
}

fn decode_buffer_descriptor(r: &mut Reader<'_>) -> Result<BufferDescriptor, WireError> {
    let label = match r.read_u8()? {
        0 => None,
        1 => Some(r.read_string()?),
        _ => return Err(WireError::InvalidEnum),
    };
    let size = r.read_u64()?;
    let usage = BufferUsages::from_bits(r.read_u32()?).ok_or(WireError::InvalidEnum)?;
    let mapped_at_creation = match r.read_u8()? {
        0 => false,
        1 => true,
        _ => return Err(WireError::InvalidEnum),
    };
    let extensions = decode_extension_chain(r)?;
    Ok(BufferDescriptor {
        label,
        size,
        usage,
        mapped_at_creation,
        extensions,
    })
}

/// Appends one length-prefixed record to a flush buffer.
pub fn push_record(stream: &mut Vec<u8>, record: &[u8]) {
    debug_assert!(record.len() <= MAX_RECORD_BYTES);
    push_u32(stream, record.len() as u32);
    stream.extend_from_slice(record);
}

/// Iterates the length-prefixed records of one transport message.
///
/// Yields `Err` once (and then stops) if a record runs past the end of the
/// message or exceeds [`MAX_RECORD_BYTES`]; the caller must treat that as
/// connection-fatal corruption.
pub struct RecordIter<'a> {
    bytes: &'a [u8],
    pos: usize,
    poisoned: bool,
}

impl<'a> RecordIter<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            poisoned: false,
        }
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<&'a [u8], WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned || self.pos == self.bytes.len() {
            return None;
        }
        let remaining = &self.bytes[self.pos..];
        if remaining.len() < 4 {
            self.poisoned = true;
            return Some(Err(WireError::UnexpectedEof));
        }
        let len = u32::from_le_bytes([remaining[0], remaining[1], remaining[2], remaining[3]])
            as usize;
        if len > MAX_RECORD_BYTES {
            self.poisoned = true;
            return Some(Err(WireError::OversizedRecord {
                len,
                max: MAX_RECORD_BYTES,
            }));
        }
        if remaining.len() - 4 < len {
            self.poisoned = true;
            return Some(Err(WireError::UnexpectedEof));
        }
        self.pos += 4 + len;
        Some(Ok(&remaining[4..4 + len]))
    }
}

pub(crate) fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_handle(out: &mut Vec<u8>, h: ObjectHandle) {
    push_u32(out, h.id);
    push_u32(out, h.generation);
}

fn push_blob(out: &mut Vec<u8>, blob: &[u8]) {
    push_u32(out, blob.len() as u32);
    out.extend_from_slice(blob);
}

fn push_opt_blob(out: &mut Vec<u8>, blob: Option<&[u8]>) {
    match blob {
        Some(blob) => {
            out.push(1);
            push_blob(out, blob);
        }
        None => out.push(0),
    }
}

fn push_str(out: &mut Vec<u8>, s: &str) {
    push_blob(out, s.as_bytes());
}

/// Bounds-checked cursor over one record.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, WireError> {
        let b = *self.bytes.get(self.pos).ok_or(WireError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, WireError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64, WireError> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    pub(crate) fn read_handle(&mut self) -> Result<ObjectHandle, WireError> {
        Ok(ObjectHandle {
            id: self.read_u32()?,
            generation: self.read_u32()?,
        })
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::UnexpectedEof);
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..start + len])
    }

    pub(crate) fn read_blob(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    fn read_opt_blob(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        match self.read_u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.read_blob()?.to_vec())),
            _ => Err(WireError::InvalidEnum),
        }
    }

    pub(crate) fn read_string(&mut self) -> Result<String, WireError> {
        let bytes = self.read_blob()?;
        core::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidUtf8)
    }
}
