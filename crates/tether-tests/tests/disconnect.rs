//! Disconnect semantics: idempotence, forced resolution, fail-local
//! afterwards, and corruption-triggered teardown.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Result;
use tether_client::{CallbackMode, ClientError, FeaturesResponse};
use tether_tests::{descriptor, record_status, status_log, Link};
use tether_wire::{BufferUsages, MapMode, MapStatus, WireError};

#[test]
fn disconnect_twice_delivers_the_lost_set_once() {
    let mut link = Link::new();
    let buf = link.buffer(8, BufferUsages::MAP_READ);
    link.pump_client();

    let log = status_log();
    for _ in 0..3 {
        link.client
            .buffer_map_async(buf, MapMode::Read, 0, 8, CallbackMode::Spontaneous, {
                record_status(&log)
            })
            .unwrap();
        // Only the first request is accepted; the rest fail locally with an
        // immediate Error, which still counts toward exactly-once.
    }

    link.client.disconnect();
    link.client.disconnect();
    assert_eq!(
        log.borrow().as_slice(),
        &[MapStatus::Error, MapStatus::Error, MapStatus::DeviceLost]
    );
}

/// Disconnect right after a map-for-read request, before any
/// flush. The callback fires with a lost status and no server-side object is
/// ever created.
#[test]
fn disconnect_before_flush_creates_nothing_server_side() {
    let mut link = Link::new();
    let buf = link.buffer(8, BufferUsages::MAP_READ);

    let log = status_log();
    link.client
        .buffer_map_async(buf, MapMode::Read, 0, 8, CallbackMode::Spontaneous, {
            record_status(&log)
        })
        .unwrap();
    link.client.disconnect();

    assert_eq!(log.borrow().as_slice(), &[MapStatus::DeviceLost]);
    assert_eq!(link.server.backend().buffer_count(), 0);
}

/// WaitAny and ProcessEvents futures must not strand on disconnect waiting
/// for a poll that may never come: they deliver immediately with the lost
/// status.
#[test]
fn deferred_mode_futures_deliver_immediately_on_disconnect() {
    let mut link = Link::new();
    let buf = link.buffer(8, BufferUsages::MAP_READ);
    link.pump_client();

    let log = status_log();
    let future = link
        .client
        .buffer_map_async(buf, MapMode::Read, 0, 8, CallbackMode::WaitAny, {
            record_status(&log)
        })
        .unwrap();
    let features: Rc<RefCell<Vec<FeaturesResponse>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&features);
    link.client
        .request_features(
            link.device,
            CallbackMode::ProcessEvents,
            Box::new(move |_, response| sink.borrow_mut().push(response)),
        )
        .unwrap();

    link.client.disconnect();
    assert_eq!(log.borrow().as_slice(), &[MapStatus::DeviceLost]);
    assert_eq!(
        features.borrow().as_slice(),
        &[FeaturesResponse::ConnectionLost]
    );
    // The polls find nothing left.
    assert_eq!(link.client.wait_any(&[future], Duration::ZERO), 0);
    assert_eq!(link.client.process_events(), 0);
}

#[test]
fn calls_after_disconnect_fail_locally() -> Result<()> {
    let mut link = Link::new();
    let buf = link.buffer(8, BufferUsages::MAP_READ);
    link.pump_client();
    link.client.disconnect();

    assert!(matches!(
        link.client
            .create_buffer(link.device, &descriptor(8, BufferUsages::MAP_READ)),
        Err(ClientError::Disconnected)
    ));
    assert!(matches!(
        link.client.flush(),
        Err(ClientError::Disconnected)
    ));
    assert!(matches!(
        link.client.handle_events(&[]),
        Err(WireError::Disconnected)
    ));

    // Local cleanup still works and touches no transport.
    link.client.release_buffer(buf)?;
    Ok(())
}

#[test]
fn server_disconnect_destroys_owned_objects_but_not_injected_devices() {
    let mut link = Link::new();
    link.buffer(8, BufferUsages::MAP_READ);
    link.buffer(8, BufferUsages::MAP_WRITE);
    link.pump_client();
    assert_eq!(link.server.backend().buffer_count(), 2);

    link.server.disconnect();
    link.server.disconnect();
    assert_eq!(link.server.backend().buffer_count(), 0);
    // The injected device is externally owned and survives.
    assert!(link.server.backend().device_exists(link.backend_device));
    assert!(link
        .server
        .handle_commands(&[])
        .is_err_and(|e| matches!(e, WireError::Disconnected)));
}

/// Protocol corruption is fatal per connection: the detecting side
/// disconnects, since the stream framing can no longer be trusted.
#[test]
fn corrupt_command_stream_disconnects_the_server() {
    let mut link = Link::new();
    // A record length prefix pointing past the end of the message.
    let mut garbage = Vec::new();
    garbage.extend_from_slice(&100u32.to_le_bytes());
    garbage.extend_from_slice(&[0u8; 10]);

    assert!(link.server.handle_commands(&garbage).is_err());
    assert!(!link.server.is_connected());
}

#[test]
fn corrupt_event_stream_disconnects_the_client_and_resolves_futures() {
    let mut link = Link::new();
    let buf = link.buffer(8, BufferUsages::MAP_READ);
    link.pump_client();

    let log = status_log();
    link.client
        .buffer_map_async(buf, MapMode::Read, 0, 8, CallbackMode::Spontaneous, {
            record_status(&log)
        })
        .unwrap();
    link.pump_client();

    let mut garbage = Vec::new();
    garbage.extend_from_slice(&2u32.to_le_bytes());
    garbage.extend_from_slice(&0x7777u16.to_le_bytes()); // unknown event tag

    assert!(link.client.handle_events(&garbage).is_err());
    assert!(!link.client.is_connected());
    assert_eq!(log.borrow().as_slice(), &[MapStatus::DeviceLost]);
}
