//! Server half of the pluggable memory-transfer service.
//!
//! The client ships an opaque creation payload with each map request; the
//! service on this side deserializes it into its own handle object. A read
//! handle then serializes the mapped bytes into the initialize payload of the
//! completion event; a write handle later decodes the flush payload sent at
//! unmap. Embedders pair a custom implementation here with its counterpart on
//! the client (shared memory, ring buffers); [`InlineTransfer`] is the
//! default where everything rides in the command stream.

use tether_wire::WireError;

/// Server counterpart of a map-for-read handle.
pub trait ReadHandle {
    /// Size of the mapped range this handle was created for.
    fn size(&self) -> u64;

    /// Serializes the range's current contents into the initialize payload.
    fn serialize_initial_data(&mut self, contents: &[u8]) -> Vec<u8>;
}

/// Server counterpart of a map-for-write handle.
pub trait WriteHandle {
    fn size(&self) -> u64;

    /// Decodes one flush payload into the full bytes of the range.
    ///
    /// All-or-nothing: an error means the payload is malformed for this
    /// handle and nothing may be applied; the handle is destroyed and never
    /// used again.
    fn deserialize_flush(&mut self, payload: &[u8]) -> Result<Vec<u8>, WireError>;
}

/// Deserializes creation payloads into handle objects. Returning `None`
/// means the payload is malformed, which the server treats as protocol
/// corruption (the client's service produced it, not application code).
pub trait MemoryTransfer {
    fn deserialize_read_handle(&mut self, create: &[u8]) -> Option<Box<dyn ReadHandle>>;
    fn deserialize_write_handle(&mut self, create: &[u8]) -> Option<Box<dyn WriteHandle>>;
}

/// Default copy-based service: the creation payload is the range size as
/// 8 LE bytes, data payloads are the raw bytes of the range.
#[derive(Default)]
pub struct InlineTransfer;

struct InlineRead {
    size: u64,
}

struct InlineWrite {
    size: u64,
}

impl ReadHandle for InlineRead {
    fn size(&self) -> u64 {
        self.size
    }

    fn serialize_initial_data(&mut self, contents: &[u8]) -> Vec<u8> {
        debug_assert_eq!(contents.len() as u64, self.size);
        contents.to_vec()
    }
}

impl WriteHandle for InlineWrite {
    fn size(&self) -> u64 {
        self.size
    }

    fn deserialize_flush(&mut self, payload: &[u8]) -> Result<Vec<u8>, WireError> {
        if payload.len() as u64 != self.size {
            return Err(WireError::UnexpectedEof);
        }
        Ok(payload.to_vec())
    }
}

fn decode_size(create: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = create.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

impl MemoryTransfer for InlineTransfer {
    fn deserialize_read_handle(&mut self, create: &[u8]) -> Option<Box<dyn ReadHandle>> {
        let size = decode_size(create)?;
        Some(Box::new(InlineRead { size }))
    }

    fn deserialize_write_handle(&mut self, create: &[u8]) -> Option<Box<dyn WriteHandle>> {
        let size = decode_size(create)?;
        Some(Box::new(InlineWrite { size }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_creation_payload_is_rejected() {
        let mut svc = InlineTransfer;
        assert!(svc.deserialize_read_handle(&[1, 2, 3]).is_none());
        assert!(svc.deserialize_write_handle(&[]).is_none());
        assert!(svc
            .deserialize_read_handle(&16u64.to_le_bytes())
            .is_some());
    }

    #[test]
    fn flush_payload_must_match_declared_size() {
        let mut svc = InlineTransfer;
        let mut h = svc.deserialize_write_handle(&4u64.to_le_bytes()).unwrap();
        assert!(h.deserialize_flush(&[1, 2, 3]).is_err());
        assert_eq!(h.deserialize_flush(&[1, 2, 3, 4]).unwrap(), vec![1, 2, 3, 4]);
    }
}
