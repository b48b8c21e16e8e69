//! Opaque references exchanged across the connection.

/// Reference to a remoted object, valid only within one connection.
///
/// Ids are recycled after release; `generation` is bumped on each reuse so a
/// stale reference from either side is detected rather than silently aliasing
/// the new occupant. Handles are never dereferenced as memory addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjectHandle {
    pub id: u32,
    pub generation: u32,
}

impl ObjectHandle {
    /// The null handle. Id 0 is never allocated.
    pub const NULL: Self = Self {
        id: 0,
        generation: 0,
    };

    pub fn new(id: u32, generation: u32) -> Self {
        Self { id, generation }
    }

    pub fn is_null(&self) -> bool {
        self.id == 0
    }
}

/// Namespace for per-type handle tables. Each side keeps one table per type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Device,
    Buffer,
    BindGroup,
}

impl ObjectType {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ObjectType::Device => 0,
            ObjectType::Buffer => 1,
            ObjectType::BindGroup => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => ObjectType::Device,
            1 => ObjectType::Buffer,
            2 => ObjectType::BindGroup,
            _ => return None,
        })
    }
}

/// Identifier of one outstanding asynchronous operation.
///
/// Allocated by the client, echoed back by the server in the completion
/// event. Never reused within a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FutureId(pub u64);
