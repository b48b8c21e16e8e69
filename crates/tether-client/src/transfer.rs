//! Client half of the pluggable memory-transfer service.
//!
//! A transfer handle exists for exactly one map cycle (or the
//! mapped-at-creation window) and is sized to the mapped range. The client
//! serializes an opaque creation payload alongside the map request; the
//! server's counterpart interprets it. Neither side assumes anything about
//! the payload format beyond what its own service wrote.

use tether_wire::WireError;

/// Client-side destination for data mapped for reading.
pub trait ReadHandle {
    /// Opaque payload carried in the map request that lets the server
    /// construct its counterpart.
    fn serialize_create(&self) -> Vec<u8>;

    /// Ingests the initial-data payload from a successful map event.
    /// Returns an error if the payload is malformed for this handle, which
    /// the client treats as wire corruption.
    fn apply_initial_data(&mut self, payload: &[u8]) -> Result<(), WireError>;

    fn data(&self) -> &[u8];
}

/// Client-side staging area for data mapped for writing.
pub trait WriteHandle {
    fn serialize_create(&self) -> Vec<u8>;

    fn data(&self) -> &[u8];

    fn data_mut(&mut self) -> &mut [u8];

    /// Flush payload carrying the staged contents back to the server at
    /// unmap. `None` means nothing to flush (no update command is sent).
    fn serialize_update(&mut self) -> Option<Vec<u8>>;
}

/// Factory for per-map transfer handles. Returning `None` signals an
/// allocation failure; the map attempt fails locally without touching the
/// wire.
pub trait MemoryTransfer {
    fn create_read_handle(&mut self, size: u64) -> Option<Box<dyn ReadHandle>>;
    fn create_write_handle(&mut self, size: u64) -> Option<Box<dyn WriteHandle>>;
}

/// Default service: data rides inline in the command stream.
///
/// The creation payload is the range size as 8 LE bytes; data payloads are
/// the raw bytes of the range.
#[derive(Default)]
pub struct InlineTransfer;

struct InlineRead {
    data: Vec<u8>,
}

struct InlineWrite {
    data: Vec<u8>,
}

impl ReadHandle for InlineRead {
    fn serialize_create(&self) -> Vec<u8> {
        (self.data.len() as u64).to_le_bytes().to_vec()
    }

    fn apply_initial_data(&mut self, payload: &[u8]) -> Result<(), WireError> {
        if payload.len() != self.data.len() {
            return Err(WireError::UnexpectedEof);
        }
        self.data.copy_from_slice(payload);
        Ok(())
    }

    fn data(&self) -> &[u8] {
        &self.data
    }
}

impl WriteHandle for InlineWrite {
    fn serialize_create(&self) -> Vec<u8> {
        (self.data.len() as u64).to_le_bytes().to_vec()
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn serialize_update(&mut self) -> Option<Vec<u8>> {
        Some(self.data.clone())
    }
}

impl MemoryTransfer for InlineTransfer {
    fn create_read_handle(&mut self, size: u64) -> Option<Box<dyn ReadHandle>> {
        let size = usize::try_from(size).ok()?;
        Some(Box::new(InlineRead {
            data: vec![0; size],
        }))
    }

    fn create_write_handle(&mut self, size: u64) -> Option<Box<dyn WriteHandle>> {
        let size = usize::try_from(size).ok()?;
        Some(Box::new(InlineWrite {
            data: vec![0; size],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_read_applies_exact_payload() {
        let mut svc = InlineTransfer;
        let mut h = svc.create_read_handle(4).unwrap();
        assert_eq!(h.serialize_create(), 4u64.to_le_bytes().to_vec());
        assert!(h.apply_initial_data(&[1, 2, 3]).is_err());
        h.apply_initial_data(&[1, 2, 3, 4]).unwrap();
        assert_eq!(h.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn inline_write_round_trips_staged_bytes() {
        let mut svc = InlineTransfer;
        let mut h = svc.create_write_handle(3).unwrap();
        h.data_mut().copy_from_slice(&[9, 8, 7]);
        assert_eq!(h.serialize_update(), Some(vec![9, 8, 7]));
    }
}
