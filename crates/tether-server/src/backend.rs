//! Capability surface of the wrapped API.
//!
//! The server never calls the real implementation directly; it drives this
//! trait, which is assumed correct for any combination of *its own* ids. The
//! server's job is to make sure only valid, same-origin combinations ever
//! reach it. [`MemBackend`] is the in-memory reference implementation used by
//! tests and single-process embedders.

use std::collections::HashMap;

use thiserror::Error;

use tether_wire::{BufferUsages, ErrorKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BackendDeviceId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BackendBufferId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BackendBindGroupId(pub u64);

/// API-level failure, reported back through the device error channel
/// unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("validation failure: {0}")]
    Validation(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("internal error: {0}")]
    Internal(String),
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::Validation(_) => ErrorKind::Validation,
            BackendError::OutOfMemory => ErrorKind::OutOfMemory,
            BackendError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// One bind group entry after handle resolution: backend buffer plus the
/// bound byte range.
#[derive(Clone, Copy, Debug)]
pub struct ResolvedBinding {
    pub binding: u32,
    pub buffer: BackendBufferId,
    pub offset: u64,
    pub size: u64,
}

/// The wrapped API's create/destroy/invoke entry points.
pub trait Backend {
    fn create_device(&mut self) -> BackendDeviceId;
    fn destroy_device(&mut self, device: BackendDeviceId);

    fn create_buffer(
        &mut self,
        device: BackendDeviceId,
        size: u64,
        usage: BufferUsages,
    ) -> Result<BackendBufferId, BackendError>;
    fn destroy_buffer(&mut self, buffer: BackendBufferId);

    fn read_buffer(
        &self,
        buffer: BackendBufferId,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, BackendError>;
    fn write_buffer(
        &mut self,
        buffer: BackendBufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError>;

    fn create_bind_group(
        &mut self,
        device: BackendDeviceId,
        entries: &[ResolvedBinding],
    ) -> Result<BackendBindGroupId, BackendError>;
    fn destroy_bind_group(&mut self, bind_group: BackendBindGroupId);

    /// Feature list of unknown-at-compile-time length; serialized
    /// generically by the codec.
    fn enumerate_features(&self, device: BackendDeviceId) -> Vec<u32>;
}

struct MemBuffer {
    #[allow(dead_code)]
    device: BackendDeviceId,
    data: Vec<u8>,
    #[allow(dead_code)]
    usage: BufferUsages,
}

struct MemBindGroup {
    #[allow(dead_code)]
    device: BackendDeviceId,
    #[allow(dead_code)]
    entries: Vec<ResolvedBinding>,
}

/// Reference backend: buffers are plain byte vectors, bind groups are
/// recorded but inert.
#[derive(Default)]
pub struct MemBackend {
    next_id: u64,
    devices: HashMap<BackendDeviceId, Vec<u32>>,
    buffers: HashMap<BackendBufferId, MemBuffer>,
    bind_groups: HashMap<BackendBindGroupId, MemBindGroup>,
    /// Optional cap on total buffer bytes, for provoking OOM in tests.
    pub allocation_limit: Option<u64>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the feature list reported for `device`.
    pub fn set_features(&mut self, device: BackendDeviceId, features: Vec<u32>) {
        if let Some(slot) = self.devices.get_mut(&device) {
            *slot = features;
        }
    }

    /// Test helper: raw contents of a buffer's backing store.
    pub fn buffer_contents(&self, buffer: BackendBufferId) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(|b| b.data.as_slice())
    }

    pub fn device_exists(&self, device: BackendDeviceId) -> bool {
        self.devices.contains_key(&device)
    }

    pub fn buffer_exists(&self, buffer: BackendBufferId) -> bool {
        self.buffers.contains_key(&buffer)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn bind_group_count(&self) -> usize {
        self.bind_groups.len()
    }

    fn allocated_bytes(&self) -> u64 {
        self.buffers.values().map(|b| b.data.len() as u64).sum()
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl Backend for MemBackend {
    fn create_device(&mut self) -> BackendDeviceId {
        let id = BackendDeviceId(self.next_id());
        self.devices.insert(id, Vec::new());
        id
    }

    fn destroy_device(&mut self, device: BackendDeviceId) {
        self.devices.remove(&device);
    }

    fn create_buffer(
        &mut self,
        device: BackendDeviceId,
        size: u64,
        usage: BufferUsages,
    ) -> Result<BackendBufferId, BackendError> {
        if !self.devices.contains_key(&device) {
            return Err(BackendError::Validation("unknown device".into()));
        }
        if let Some(limit) = self.allocation_limit {
            if self.allocated_bytes().saturating_add(size) > limit {
                return Err(BackendError::OutOfMemory);
            }
        }
        let len = usize::try_from(size).map_err(|_| BackendError::OutOfMemory)?;
        let id = BackendBufferId(self.next_id());
        self.buffers.insert(
            id,
            MemBuffer {
                device,
                data: vec![0; len],
                usage,
            },
        );
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: BackendBufferId) {
        self.buffers.remove(&buffer);
    }

    fn read_buffer(
        &self,
        buffer: BackendBufferId,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, BackendError> {
        let buf = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| BackendError::Validation("unknown buffer".into()))?;
        let range = byte_range(offset, size, buf.data.len())?;
        Ok(buf.data[range].to_vec())
    }

    fn write_buffer(
        &mut self,
        buffer: BackendBufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        let buf = self
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| BackendError::Validation("unknown buffer".into()))?;
        let range = byte_range(offset, data.len() as u64, buf.data.len())?;
        buf.data[range].copy_from_slice(data);
        Ok(())
    }

    fn create_bind_group(
        &mut self,
        device: BackendDeviceId,
        entries: &[ResolvedBinding],
    ) -> Result<BackendBindGroupId, BackendError> {
        if !self.devices.contains_key(&device) {
            return Err(BackendError::Validation("unknown device".into()));
        }
        for entry in entries {
            let buf = self
                .buffers
                .get(&entry.buffer)
                .ok_or_else(|| BackendError::Validation("unknown buffer".into()))?;
            byte_range(entry.offset, entry.size, buf.data.len())?;
        }
        let id = BackendBindGroupId(self.next_id());
        self.bind_groups.insert(
            id,
            MemBindGroup {
                device,
                entries: entries.to_vec(),
            },
        );
        Ok(id)
    }

    fn destroy_bind_group(&mut self, bind_group: BackendBindGroupId) {
        self.bind_groups.remove(&bind_group);
    }

    fn enumerate_features(&self, device: BackendDeviceId) -> Vec<u32> {
        self.devices.get(&device).cloned().unwrap_or_default()
    }
}

fn byte_range(offset: u64, size: u64, len: usize) -> Result<std::ops::Range<usize>, BackendError> {
    let end = offset
        .checked_add(size)
        .ok_or_else(|| BackendError::Validation("range overflows".into()))?;
    if end > len as u64 {
        return Err(BackendError::Validation("range out of bounds".into()));
    }
    Ok(offset as usize..end as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_round_trip() {
        let mut backend = MemBackend::new();
        let dev = backend.create_device();
        let buf = backend
            .create_buffer(dev, 8, BufferUsages::MAP_WRITE)
            .unwrap();
        backend.write_buffer(buf, 2, &[1, 2, 3]).unwrap();
        assert_eq!(backend.read_buffer(buf, 0, 8).unwrap(), vec![0, 0, 1, 2, 3, 0, 0, 0]);
        assert!(backend.read_buffer(buf, 6, 4).is_err());
    }

    #[test]
    fn allocation_limit_produces_oom() {
        let mut backend = MemBackend::new();
        backend.allocation_limit = Some(16);
        let dev = backend.create_device();
        backend
            .create_buffer(dev, 12, BufferUsages::COPY_DST)
            .unwrap();
        assert_eq!(
            backend.create_buffer(dev, 8, BufferUsages::COPY_DST),
            Err(BackendError::OutOfMemory)
        );
    }

    #[test]
    fn features_are_per_device() {
        let mut backend = MemBackend::new();
        let a = backend.create_device();
        let b = backend.create_device();
        backend.set_features(a, vec![3, 1, 4]);
        assert_eq!(backend.enumerate_features(a), vec![3, 1, 4]);
        assert_eq!(backend.enumerate_features(b), Vec::<u32>::new());
    }
}
