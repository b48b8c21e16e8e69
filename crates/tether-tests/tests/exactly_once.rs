//! Exactly-once callback delivery across every mode/outcome interleaving.
//!
//! For all four callback modes and every terminal path — success, local
//! error, server-reported error, disconnect, release-before-completion — the
//! registered callback fires exactly once, and re-polling after delivery
//! never re-delivers.

use std::time::Duration;

use tether_client::CallbackMode;
use tether_tests::{record_status, status_log, Link};
use tether_wire::{BufferUsages, MapMode, MapStatus};

const MODES: [CallbackMode; 4] = [
    CallbackMode::Spontaneous,
    CallbackMode::LegacyAsync,
    CallbackMode::WaitAny,
    CallbackMode::ProcessEvents,
];

#[derive(Clone, Copy, Debug)]
enum Outcome {
    Success,
    /// Usage mismatch caught client-side; nothing reaches the wire.
    LocalError,
    /// The server replies with an Error status: its backend refused the
    /// buffer allocation, so the map hits an error placeholder the client
    /// has no way to know about.
    ServerError,
    /// Connection severed before the request was ever flushed.
    Disconnect,
    /// Buffer released while the completion is still in flight.
    Release,
}

fn expected(outcome: Outcome) -> MapStatus {
    match outcome {
        Outcome::Success => MapStatus::Success,
        Outcome::LocalError | Outcome::ServerError => MapStatus::Error,
        Outcome::Disconnect => MapStatus::DeviceLost,
        Outcome::Release => MapStatus::DestroyedBeforeCallback,
    }
}

/// Does this (mode, outcome) pair defer delivery to an explicit poll?
/// Local failures, disconnect, and release deliver immediately in every
/// mode — no further server interaction could ever satisfy a poll.
fn deferred(mode: CallbackMode, outcome: Outcome) -> bool {
    matches!(mode, CallbackMode::WaitAny | CallbackMode::ProcessEvents)
        && matches!(outcome, Outcome::Success | Outcome::ServerError)
}

fn run(mode: CallbackMode, outcome: Outcome) {
    let mut link = Link::new();
    if matches!(outcome, Outcome::ServerError) {
        link.server.backend_mut().allocation_limit = Some(0);
    }
    let usage = match outcome {
        Outcome::LocalError => BufferUsages::COPY_DST,
        _ => BufferUsages::MAP_READ,
    };
    let buf = link.buffer(8, usage);
    link.pump_client();

    let log = status_log();
    let future = link
        .client
        .buffer_map_async(buf, MapMode::Read, 0, 8, mode, record_status(&log))
        .unwrap();

    match outcome {
        Outcome::Success | Outcome::ServerError => link.roundtrip(),
        Outcome::LocalError => link.roundtrip(),
        Outcome::Disconnect => link.client.disconnect(),
        Outcome::Release => {
            // The server's Success reply is queued but not yet flushed when
            // the client gives the buffer up.
            link.pump_client();
            link.client.release_buffer(buf).unwrap();
            link.pump_server();
        }
    }

    if deferred(mode, outcome) {
        assert_eq!(log.borrow().len(), 0, "mode {mode:?} delivered early");
        let polled = match mode {
            CallbackMode::WaitAny => link.client.wait_any(&[future], Duration::ZERO),
            CallbackMode::ProcessEvents => link.client.process_events(),
            _ => unreachable!(),
        };
        assert_eq!(polled, 1);
    }

    // Hammer every delivery path again; nothing may fire twice.
    link.client.wait_any(&[future], Duration::ZERO);
    link.client.process_events();
    if link.client.is_connected() {
        link.roundtrip();
    }
    assert_eq!(
        log.borrow().as_slice(),
        &[expected(outcome)],
        "mode {mode:?} outcome {outcome:?}"
    );
}

#[test]
fn every_mode_and_outcome_delivers_exactly_once() {
    for mode in MODES {
        for outcome in [
            Outcome::Success,
            Outcome::LocalError,
            Outcome::ServerError,
            Outcome::Disconnect,
            Outcome::Release,
        ] {
            run(mode, outcome);
        }
    }
}
