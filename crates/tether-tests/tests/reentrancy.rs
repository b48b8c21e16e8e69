//! Callbacks that re-enter the connection must neither deadlock nor
//! re-deliver themselves.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tether_client::CallbackMode;
use tether_tests::{record_status, status_log, Link};
use tether_wire::{BufferUsages, FutureId, MapMode, MapStatus};

/// A callback that issues a new async call on the same connection: the new
/// call's callback also fires, exactly once.
#[test]
fn callback_may_issue_new_async_calls() {
    let mut link = Link::new();
    let buf = link.buffer(8, BufferUsages::MAP_READ);
    link.pump_client();

    let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    let outer = Rc::clone(&log);
    let inner = Rc::clone(&log);
    link.client
        .buffer_map_async(
            buf,
            MapMode::Read,
            0,
            8,
            CallbackMode::Spontaneous,
            Box::new(move |client, status| {
                assert_eq!(status, MapStatus::Success);
                outer.borrow_mut().push("outer");
                client.buffer_unmap(buf).unwrap();
                client
                    .buffer_map_async(
                        buf,
                        MapMode::Read,
                        0,
                        4,
                        CallbackMode::Spontaneous,
                        Box::new(move |_, status| {
                            assert_eq!(status, MapStatus::Success);
                            inner.borrow_mut().push("inner");
                        }),
                    )
                    .unwrap();
            }),
        )
        .unwrap();

    link.roundtrip();
    assert_eq!(log.borrow().as_slice(), &["outer"]);
    link.roundtrip();
    assert_eq!(log.borrow().as_slice(), &["outer", "inner"]);
}

/// A callback that polls its own (already-delivered) future id must not see
/// it again.
#[test]
fn callback_cannot_redeliver_itself() {
    let mut link = Link::new();
    let buf = link.buffer(8, BufferUsages::MAP_READ);
    link.pump_client();

    let count = Rc::new(RefCell::new(0u32));
    let sink = Rc::clone(&count);
    let future_cell: Rc<RefCell<Option<FutureId>>> = Rc::new(RefCell::new(None));
    let future_for_cb = Rc::clone(&future_cell);
    let future = link
        .client
        .buffer_map_async(
            buf,
            MapMode::Read,
            0,
            8,
            CallbackMode::WaitAny,
            Box::new(move |client, _| {
                *sink.borrow_mut() += 1;
                let id = future_for_cb.borrow().unwrap();
                // Re-entrant poll of our own id: the record is already gone.
                assert_eq!(client.wait_any(&[id], Duration::ZERO), 0);
                assert_eq!(client.process_events(), 0);
            }),
        )
        .unwrap();
    *future_cell.borrow_mut() = Some(future);

    link.roundtrip();
    assert_eq!(link.client.wait_any(&[future], Duration::ZERO), 1);
    assert_eq!(*count.borrow(), 1);
    assert_eq!(link.client.wait_any(&[future], Duration::ZERO), 0);
}

/// A callback that disconnects mid-delivery: every other outstanding future
/// still resolves exactly once, and the re-entrant disconnect is a no-op by
/// the time the outer one finishes.
#[test]
fn callback_may_disconnect_the_connection() {
    let mut link = Link::new();
    let a = link.buffer(8, BufferUsages::MAP_READ);
    let b = link.buffer(8, BufferUsages::MAP_READ);
    link.pump_client();

    let log = status_log();
    let sink = Rc::clone(&log);
    link.client
        .buffer_map_async(
            a,
            MapMode::Read,
            0,
            8,
            CallbackMode::Spontaneous,
            Box::new(move |client, status| {
                sink.borrow_mut().push(status);
                client.disconnect();
            }),
        )
        .unwrap();
    link.client
        .buffer_map_async(b, MapMode::Read, 0, 8, CallbackMode::Spontaneous, {
            record_status(&log)
        })
        .unwrap();

    link.pump_client();
    // The first completion disconnects the client from inside its own
    // callback; the second future resolves through the disconnect path.
    let _ = link.try_pump_server();
    assert_eq!(
        log.borrow().as_slice(),
        &[MapStatus::Success, MapStatus::DeviceLost]
    );
    assert!(!link.client.is_connected());
}
