use anyhow::Result;
use groundbus::{Config, Connection, Kind, Message};
use std::time::{Duration, Instant};

fn connection(extra: &str) -> Result<Connection> {
    let conn = Connection::new(Config::from_args(&format!("mw-id=loopback {extra}"))?)?;
    conn.connect()?;
    Ok(conn)
}

fn message(subject: &str, n: i32) -> Message {
    let mut msg = Message::new(subject, Kind::Publish).unwrap();
    msg.add_field_value("N", n).unwrap();
    msg
}

/// Binned messages are held until the bin timeout, then the subscriber
/// receives exactly the constituents, in publish order per subject.
#[test]
fn binned_messages_flush_on_timeout() -> Result<()> {
    let subscriber = connection("")?;
    subscriber.subscribe("AGG1.>")?;

    let publisher = connection(
        "gmsec-use-msg-bins=true gmsec-msg-bin-size=10 \
         gmsec-msg-bin-timeout=1000 gmsec-msg-bin-subject=AGG1.>",
    )?;

    publisher.publish(&message("AGG1.X", 1))?;
    publisher.publish(&message("AGG1.X", 2))?;
    publisher.publish(&message("AGG1.Y", 3))?;

    // Nothing arrives before the bin timeout.
    assert!(subscriber.receive(300)?.is_none());

    // After the timeout, exactly three constituents arrive.
    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    while received.len() < 3 && Instant::now() < deadline {
        if let Some(msg) = subscriber.receive(500)? {
            received.push(msg);
        }
    }
    assert_eq!(received.len(), 3);
    assert!(subscriber.receive(300)?.is_none(), "more than 3 delivered");

    // Per-subject publish order is preserved.
    let xs: Vec<i64> = received
        .iter()
        .filter(|m| m.subject() == "AGG1.X")
        .map(|m| m.get_field("N").unwrap().i64_value().unwrap())
        .collect();
    assert_eq!(xs, vec![1, 2]);
    assert_eq!(
        received.iter().filter(|m| m.subject() == "AGG1.Y").count(),
        1
    );

    publisher.disconnect()?;
    subscriber.disconnect()?;
    Ok(())
}

/// A full bin flushes without waiting for its timeout.
#[test]
fn full_bin_flushes_early() -> Result<()> {
    let subscriber = connection("")?;
    subscriber.subscribe("AGG2.>")?;

    let publisher = connection(
        "gmsec-use-msg-bins=true gmsec-msg-bin-size=2 \
         gmsec-msg-bin-timeout=30000 gmsec-msg-bin-subject=AGG2.>",
    )?;

    publisher.publish(&message("AGG2.X", 1))?;
    publisher.publish(&message("AGG2.X", 2))?;

    // Flush happens on the worker's next scan, far before the 30 s
    // timeout.
    assert!(subscriber.receive(2000)?.is_some());
    assert!(subscriber.receive(2000)?.is_some());

    publisher.disconnect()?;
    subscriber.disconnect()?;
    Ok(())
}

/// Subjects outside the bin filter bypass aggregation entirely.
#[test]
fn unbinned_subjects_publish_directly() -> Result<()> {
    let subscriber = connection("")?;
    subscriber.subscribe("AGG3.>")?;

    let publisher = connection(
        "gmsec-use-msg-bins=true gmsec-msg-bin-timeout=30000 \
         gmsec-msg-bin-subject=AGG3.BINNED.>",
    )?;

    publisher.publish(&message("AGG3.DIRECT", 1))?;
    let got = subscriber.receive(1000)?.expect("direct publish delayed");
    assert_eq!(got.subject(), "AGG3.DIRECT");

    publisher.disconnect()?;
    subscriber.disconnect()?;
    Ok(())
}

/// Disconnect flushes whatever is still sitting in open bins.
#[test]
fn disconnect_flushes_open_bins() -> Result<()> {
    let subscriber = connection("")?;
    subscriber.subscribe("AGG4.>")?;

    let publisher = connection(
        "gmsec-use-msg-bins=true gmsec-msg-bin-size=100 \
         gmsec-msg-bin-timeout=60000 gmsec-msg-bin-subject=AGG4.>",
    )?;
    publisher.publish(&message("AGG4.X", 1))?;
    publisher.disconnect()?;

    let got = subscriber.receive(2000)?.expect("bin not flushed on disconnect");
    assert_eq!(got.subject(), "AGG4.X");

    subscriber.disconnect()?;
    Ok(())
}
