//! Outstanding-future registry.
//!
//! Every asynchronous operation gets a `FutureRecord` keyed by its wire-level
//! future id. The state machine is `Pending -> Ready -> delivered`, where
//! "delivered" means *removed from the registry*: delivery always takes the
//! record out before the user callback runs, so a callback that re-enters the
//! client (issues new async calls, polls its own id, disconnects) can never
//! observe or re-deliver itself. Disconnect and release force pending records
//! to a terminal lost/destroyed outcome through the same take-first path.

use std::collections::BTreeMap;

use tether_wire::{FutureId, MapStatus, ObjectHandle};

use crate::client::Client;

/// Delivery policy of one future, fixed at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackMode {
    /// Delivered the instant the client observes completion while processing
    /// incoming events.
    Spontaneous,
    /// Behaviorally identical to [`CallbackMode::Spontaneous`]; kept for
    /// callers of the older non-future-returning entry points.
    LegacyAsync,
    /// Deferred until the caller polls the future id via `Client::wait_any`.
    WaitAny,
    /// Deferred until the caller drains events via `Client::process_events`.
    ProcessEvents,
}

impl CallbackMode {
    pub(crate) fn is_deferred(self) -> bool {
        matches!(self, CallbackMode::WaitAny | CallbackMode::ProcessEvents)
    }
}

pub type MapCallback = Box<dyn FnOnce(&mut Client, MapStatus)>;

/// Terminal outcome of a feature enumeration request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeaturesResponse {
    Ready(Vec<u32>),
    ConnectionLost,
    DestroyedBeforeCallback,
}

pub type FeaturesCallback = Box<dyn FnOnce(&mut Client, FeaturesResponse)>;

pub(crate) enum PendingOp {
    Map {
        buffer: ObjectHandle,
        callback: MapCallback,
    },
    Features {
        device: ObjectHandle,
        callback: FeaturesCallback,
    },
}

pub(crate) enum ReadyOp {
    Map {
        buffer: ObjectHandle,
        callback: MapCallback,
        status: MapStatus,
    },
    Features {
        callback: FeaturesCallback,
        response: FeaturesResponse,
    },
}

enum State {
    Pending(PendingOp),
    Ready(ReadyOp),
}

pub(crate) struct FutureRecord {
    pub mode: CallbackMode,
    state: State,
}

#[derive(Default)]
pub(crate) struct FutureRegistry {
    next: u64,
    records: BTreeMap<FutureId, FutureRecord>,
}

impl FutureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Future ids are never reused within a connection.
    pub fn next_id(&mut self) -> FutureId {
        self.next += 1;
        FutureId(self.next)
    }

    pub fn register(&mut self, id: FutureId, mode: CallbackMode, op: PendingOp) {
        let prev = self.records.insert(
            id,
            FutureRecord {
                mode,
                state: State::Pending(op),
            },
        );
        debug_assert!(prev.is_none(), "future id reused");
    }

    pub fn mode(&self, id: FutureId) -> Option<CallbackMode> {
        self.records.get(&id).map(|r| r.mode)
    }

    /// Removes the record outright (immediate delivery or forced resolution).
    pub fn take(&mut self, id: FutureId) -> Option<FutureRecord> {
        self.records.remove(&id)
    }

    /// Transitions a pending map future to Ready for deferred delivery.
    /// Ignored if the future is unknown or already Ready (a duplicate
    /// completion must not re-arm it).
    pub fn make_ready_map(&mut self, id: FutureId, status: MapStatus) {
        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        match std::mem::replace(&mut record.state, State::Ready(placeholder())) {
            State::Pending(PendingOp::Map { buffer, callback }) => {
                record.state = State::Ready(ReadyOp::Map {
                    buffer,
                    callback,
                    status,
                });
            }
            other => record.state = other,
        }
    }

    pub fn make_ready_features(&mut self, id: FutureId, response: FeaturesResponse) {
        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        match std::mem::replace(&mut record.state, State::Ready(placeholder())) {
            State::Pending(PendingOp::Features { callback, .. }) => {
                record.state = State::Ready(ReadyOp::Features { callback, response });
            }
            other => record.state = other,
        }
    }

    /// Removes and returns a Ready record of the given mode; Pending records
    /// and other modes are left untouched.
    pub fn take_ready(&mut self, id: FutureId, mode: CallbackMode) -> Option<ReadyOp> {
        match self.records.get(&id) {
            Some(record) if record.mode == mode && matches!(record.state, State::Ready(_)) => {}
            _ => return None,
        }
        match self.records.remove(&id)?.state {
            State::Ready(op) => Some(op),
            State::Pending(_) => unreachable!(),
        }
    }

    /// Ready future ids of one mode, in request order.
    pub fn ready_ids(&self, mode: CallbackMode) -> Vec<FutureId> {
        self.records
            .iter()
            .filter(|(_, r)| r.mode == mode && matches!(r.state, State::Ready(_)))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drains every record in request order (disconnect path).
    pub fn take_all(&mut self) -> Vec<FutureRecord> {
        std::mem::take(&mut self.records).into_values().collect()
    }

    /// Pending feature requests against `device`, in request order.
    pub fn pending_on_device(&self, device: ObjectHandle) -> Vec<FutureId> {
        self.records
            .iter()
            .filter(|(_, r)| {
                matches!(
                    &r.state,
                    State::Pending(PendingOp::Features { device: d, .. }) if *d == device
                )
            })
            .map(|(id, _)| *id)
            .collect()
    }
}

impl FutureRecord {
    /// Consumes the record into the terminal outcome used when the owning
    /// connection or object goes away before (or after) completion.
    pub(crate) fn into_lost(self) -> ReadyOp {
        match self.state {
            State::Pending(PendingOp::Map { buffer, callback })
            | State::Ready(ReadyOp::Map {
                buffer, callback, ..
            }) => ReadyOp::Map {
                buffer,
                callback,
                status: MapStatus::DeviceLost,
            },
            State::Pending(PendingOp::Features { callback, .. })
            | State::Ready(ReadyOp::Features { callback, .. }) => ReadyOp::Features {
                callback,
                response: FeaturesResponse::ConnectionLost,
            },
        }
    }

    pub(crate) fn into_destroyed(self) -> ReadyOp {
        match self.state {
            State::Pending(PendingOp::Map { buffer, callback })
            | State::Ready(ReadyOp::Map {
                buffer, callback, ..
            }) => ReadyOp::Map {
                buffer,
                callback,
                status: MapStatus::DestroyedBeforeCallback,
            },
            State::Pending(PendingOp::Features { callback, .. })
            | State::Ready(ReadyOp::Features { callback, .. }) => ReadyOp::Features {
                callback,
                response: FeaturesResponse::DestroyedBeforeCallback,
            },
        }
    }
}

fn placeholder() -> ReadyOp {
    ReadyOp::Map {
        buffer: ObjectHandle::NULL,
        callback: Box::new(|_, _| {}),
        status: MapStatus::Unknown,
    }
}
