//! End-to-end tests driving two full swarms against each other through the
//! in-memory driver: security negotiation, Noise XX, substream setup,
//! identify exchange, ping liveness and teardown.

mod common;

use common::{init_logging, TestNet};
use filament::{DisconnectReason, Event, PingConfig, Swarm};

fn fast_ping() -> PingConfig {
    PingConfig {
        interval_ms: 1_000,
        timeout_ms: 500,
    }
}

#[test]
fn two_swarms_secure_a_connection() {
    init_logging();
    let mut net = TestNet::new(2, 100);
    net.connect(0, 1);

    let established_a = net.established(0);
    let established_b = net.established(1);
    assert_eq!(established_a.len(), 1, "dialer secured one connection");
    assert_eq!(established_b.len(), 1, "listener secured one connection");

    // Each side learned the other's real identity.
    assert_eq!(established_a[0].1, net.swarms[1].local_peer_id());
    assert_eq!(established_b[0].1, net.swarms[0].local_peer_id());
}

#[test]
fn identify_exchanges_metadata_both_ways() {
    init_logging();
    let mut net = TestNet::new(2, 200);
    net.connect(0, 1);

    for (local, remote) in [(0usize, 1usize), (1, 0)] {
        let infos: Vec<_> = net.events[local]
            .iter()
            .filter_map(|e| match e {
                Event::Identified { info, .. } => Some(info.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(infos.len(), 1, "swarm {local} identified its peer once");
        let info = &infos[0];
        assert_eq!(info.peer, net.swarms[remote].local_peer_id());
        assert!(info.agent_version.starts_with("filament/"));
        assert!(info.protocols.iter().any(|p| p == "/meshsub/1.1.0"));
        assert_eq!(info.listen_addrs.len(), 1, "peer advertises its listen addr");
    }
}

#[test]
fn ping_round_trip_and_reschedule() {
    init_logging();
    let swarms = vec![
        Swarm::builder().rng_seed(300).ping(fast_ping()).build(),
        Swarm::builder().rng_seed(301).ping(fast_ping()).build(),
    ];
    let mut net = TestNet::with_swarms(swarms);
    net.connect(0, 1);

    // The first probe completes during connection setup.
    let pongs = |events: &[Event]| {
        events
            .iter()
            .filter(|e| matches!(e, Event::PongReceived { .. }))
            .count()
    };
    assert_eq!(pongs(&net.events[0]), 1);
    assert_eq!(pongs(&net.events[1]), 1);

    // Each interval elapsed fires exactly one more probe per side.
    net.advance(1_100);
    assert_eq!(pongs(&net.events[0]), 2);
    assert_eq!(pongs(&net.events[1]), 2);
}

#[test]
fn ping_timeout_closes_the_connection() {
    init_logging();
    let swarms = vec![
        Swarm::builder().rng_seed(400).ping(fast_ping()).build(),
        Swarm::builder().rng_seed(401).ping(fast_ping()).build(),
    ];
    let mut net = TestNet::with_swarms(swarms);
    net.connect(0, 1);
    net.take_events(0);

    // Swarm 1 goes silent: its echoes never arrive.
    net.partition(1, 0);
    net.advance(2_000);

    let events = net.take_events(0);
    assert!(
        events.iter().any(|e| matches!(e, Event::PingTimeout { .. })),
        "missing PingTimeout in {events:?}"
    );
    assert!(
        events.iter().any(|e| matches!(
            e,
            Event::ConnectionClosed { reason: DisconnectReason::PingTimeout, .. }
        )),
        "missing ConnectionClosed in {events:?}"
    );
    assert_eq!(net.swarms[0].connection_count(), 0);
}

#[test]
fn local_close_notifies_both_sides() {
    init_logging();
    let mut net = TestNet::new(2, 500);
    net.connect(0, 1);
    let conn_a = net.established(0)[0].0;
    net.take_events(0);
    net.take_events(1);

    net.swarms[0].close(conn_a).expect("close known connection");
    net.run();

    let events_a = net.take_events(0);
    assert!(events_a.iter().any(|e| matches!(
        e,
        Event::ConnectionClosed { reason: DisconnectReason::Local, .. }
    )));
    let events_b = net.take_events(1);
    assert!(events_b.iter().any(|e| matches!(
        e,
        Event::ConnectionClosed { reason: DisconnectReason::Remote, .. }
    )));
    assert_eq!(net.swarms[0].connection_count(), 0);
    assert_eq!(net.swarms[1].connection_count(), 0);
}

#[test]
fn application_payloads_never_cross_in_plaintext() {
    init_logging();
    let mut net = TestNet::new(2, 600);
    net.connect(0, 1);
    net.swarms[0].subscribe("private").unwrap();
    net.swarms[1].subscribe("private").unwrap();
    net.run();
    net.advance(1_100);

    let secret = b"attack at dawn, bring snacks";
    net.swarms[0]
        .publish("private", secret.to_vec())
        .expect("routed publish");
    net.run();

    // The subscriber got it…
    assert!(net.events[1].iter().any(
        |e| matches!(e, Event::Message { data, .. } if data == secret)
    ));
    // …but no wire frame ever carried the plaintext.
    for (_, frame) in &net.wire_log {
        assert!(
            !frame
                .windows(secret.len())
                .any(|window| window == secret.as_slice()),
            "plaintext leaked onto the wire"
        );
    }
}

#[test]
fn swarms_run_independently() {
    init_logging();
    // Two disjoint pairs in one process must not interfere.
    let mut net = TestNet::new(4, 700);
    net.connect(0, 1);
    net.connect(2, 3);
    net.swarms[0].subscribe("only-first-pair").unwrap();
    net.swarms[1].subscribe("only-first-pair").unwrap();
    net.run();
    net.advance(1_100);

    net.swarms[0]
        .publish("only-first-pair", b"hello".to_vec())
        .unwrap();
    net.run();

    assert!(net.events[1].iter().any(|e| matches!(e, Event::Message { .. })));
    assert!(!net.events[2].iter().any(|e| matches!(e, Event::Message { .. })));
    assert!(!net.events[3].iter().any(|e| matches!(e, Event::Message { .. })));
}
