use tether_wire::{BufferUsages, FutureId, MapMode, MapStatus};

use crate::transfer::{ReadHandle, WriteHandle};

/// What the caller may do with the buffer's memory right now.
pub(crate) enum MapState {
    Unmapped,
    /// Mapped at creation: writable until the first unmap, then gone.
    MappedAtCreation { size: u64 },
    MappedForRead { offset: u64, size: u64 },
    MappedForWrite { offset: u64, size: u64 },
}

/// A map request in flight. `override_status` is set when the buffer is
/// unmapped or released while the request is outstanding; it wins over
/// whatever status the server later reports.
pub(crate) struct PendingMap {
    pub future: FutureId,
    pub mode: MapMode,
    pub offset: u64,
    pub size: u64,
    pub override_status: Option<MapStatus>,
}

pub(crate) struct BufferRecord {
    pub size: u64,
    pub usage: BufferUsages,
    pub map: MapState,
    pub pending: Option<PendingMap>,
    /// Per-cycle transfer handles. At most one is live at a time; both are
    /// dropped when the cycle ends.
    pub read_handle: Option<Box<dyn ReadHandle>>,
    pub write_handle: Option<Box<dyn WriteHandle>>,
}

impl BufferRecord {
    pub fn new(size: u64, usage: BufferUsages) -> Self {
        Self {
            size,
            usage,
            map: MapState::Unmapped,
            pending: None,
            read_handle: None,
            write_handle: None,
        }
    }

    pub fn is_mapped(&self) -> bool {
        !matches!(self.map, MapState::Unmapped)
    }

    /// Readable range, if any. Mapped-at-creation memory is readable too.
    pub fn readable_range(&self) -> Option<(u64, u64)> {
        match self.map {
            MapState::MappedForRead { offset, size } | MapState::MappedForWrite { offset, size } => {
                Some((offset, size))
            }
            MapState::MappedAtCreation { size } => Some((0, size)),
            MapState::Unmapped => None,
        }
    }

    pub fn writable_range(&self) -> Option<(u64, u64)> {
        match self.map {
            MapState::MappedForWrite { offset, size } => Some((offset, size)),
            MapState::MappedAtCreation { size } => Some((0, size)),
            _ => None,
        }
    }
}
