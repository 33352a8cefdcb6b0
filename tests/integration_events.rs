use anyhow::Result;
use groundbus::transport::loopback;
use groundbus::{
    shared_event_callback, Config, Connection, ConnectionEvent, ConnectionState, Status,
    StatusCode,
};
use parking_lot::Mutex;
use std::sync::Arc;

// This file runs as its own process: sever_all_links touches every
// loopback client, so these tests must not share a bus with others —
// and must not run concurrently with each other.
static GATE: Mutex<()> = Mutex::new(());

#[test]
fn broken_connection_raises_connection_lost_once() -> Result<()> {
    let _serial = GATE.lock();
    let conn = Connection::new(Config::from_args("mw-id=loopback")?)?;

    let events = Arc::new(Mutex::new(Vec::<(ConnectionEvent, StatusCode)>::new()));

    let sink = Arc::clone(&events);
    conn.register_event_callback(
        ConnectionEvent::ConnectionBroken,
        shared_event_callback(move |event: ConnectionEvent, status: &Status| {
            sink.lock().push((event, status.code()));
        }),
    );
    let sink = Arc::clone(&events);
    conn.register_event_callback(
        ConnectionEvent::ConnectionSuccessful,
        shared_event_callback(move |event: ConnectionEvent, status: &Status| {
            sink.lock().push((event, status.code()));
        }),
    );
    let sink = Arc::clone(&events);
    conn.register_event_callback(
        ConnectionEvent::ConnectionReconnect,
        shared_event_callback(move |event: ConnectionEvent, status: &Status| {
            sink.lock().push((event, status.code()));
        }),
    );

    conn.connect()?;
    assert_eq!(conn.state(), ConnectionState::Connected);

    // Simulate a transient broker outage.
    loopback::sever_all_links();

    let snapshot = events.lock().clone();
    assert_eq!(
        snapshot,
        vec![
            (ConnectionEvent::ConnectionSuccessful, StatusCode::NoErrorCode),
            (ConnectionEvent::ConnectionBroken, StatusCode::ConnectionLost),
            (
                ConnectionEvent::ConnectionReconnect,
                StatusCode::ConnectionReconnect
            ),
        ]
    );
    // The state machine went Connected → Reconnecting → Connected.
    assert_eq!(conn.state(), ConnectionState::Connected);

    conn.disconnect()?;
    Ok(())
}

#[test]
fn all_events_slot_catches_unregistered_kinds() -> Result<()> {
    let _serial = GATE.lock();
    let conn = Connection::new(Config::from_args("mw-id=loopback")?)?;

    let seen = Arc::new(Mutex::new(Vec::<ConnectionEvent>::new()));
    let sink = Arc::clone(&seen);
    conn.register_event_callback(
        ConnectionEvent::AllEvents,
        shared_event_callback(move |event: ConnectionEvent, _status: &Status| {
            sink.lock().push(event);
        }),
    );

    conn.connect()?;
    assert_eq!(
        *seen.lock(),
        vec![ConnectionEvent::ConnectionSuccessful]
    );

    conn.disconnect()?;
    Ok(())
}

#[test]
fn no_events_after_teardown() -> Result<()> {
    let _serial = GATE.lock();
    let conn = Connection::new(Config::from_args("mw-id=loopback")?)?;
    let count = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&count);
    conn.register_event_callback(
        ConnectionEvent::ConnectionBroken,
        shared_event_callback(move |_event: ConnectionEvent, _status: &Status| {
            *sink.lock() += 1;
        }),
    );

    conn.connect()?;
    conn.disconnect()?;

    // The host was cleared first during teardown: a late fault report
    // from the driver layer reaches nobody.
    loopback::sever_all_links();
    assert_eq!(*count.lock(), 0);
    Ok(())
}
