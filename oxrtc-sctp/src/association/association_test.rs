use super::*;
use bytes::Bytes;

fn new_pair() -> (Association, Association) {
    new_pair_with(AssociationConfig::default())
}

fn new_pair_with(config: AssociationConfig) -> (Association, Association) {
    let client = Association::new(AssociationConfig {
        is_client: true,
        ..config.clone()
    });
    let server = Association::new(AssociationConfig {
        is_client: false,
        ..config
    });
    (client, server)
}

/// Shuttles every queued packet between the two endpoints until both
/// transmit queues are empty.
fn bridge(a: &mut Association, b: &mut Association, now: Instant) {
    loop {
        let mut moved = false;
        while let Some(pkt) = a.poll_transmit() {
            b.handle_read(&pkt, now).unwrap();
            moved = true;
        }
        while let Some(pkt) = b.poll_transmit() {
            a.handle_read(&pkt, now).unwrap();
            moved = true;
        }
        if !moved {
            return;
        }
    }
}

fn establish(client: &mut Association, server: &mut Association, now: Instant) {
    client.connect(now).unwrap();
    bridge(client, server, now);
    assert_eq!(client.state(), AssociationState::Established);
    assert_eq!(server.state(), AssociationState::Established);
    assert_eq!(client.poll_event(), Some(AssociationEvent::Connected));
    assert_eq!(server.poll_event(), Some(AssociationEvent::Connected));
}

fn received_payloads(assoc: &mut Association) -> Vec<Bytes> {
    let mut payloads = vec![];
    while let Some(event) = assoc.poll_event() {
        if let AssociationEvent::DataReceived { data, .. } = event {
            payloads.push(data);
        }
    }
    payloads
}

#[test]
fn test_four_way_handshake() {
    let (mut client, mut server) = new_pair();
    let now = Instant::now();
    establish(&mut client, &mut server, now);
    assert!(client.poll_event().is_none());
    assert!(server.poll_event().is_none());
}

#[test]
fn test_ordered_delivery_with_loss_and_duplication() {
    let (mut client, mut server) = new_pair();
    let now = Instant::now();
    establish(&mut client, &mut server, now);

    for payload in [b"alpha".as_slice(), b"bravo", b"charlie"] {
        client
            .write(0, 53, payload, true, ReliabilityPolicy::Reliable, now)
            .unwrap();
    }
    let first = client.poll_transmit().unwrap();
    let _lost = client.poll_transmit().unwrap();
    let third = client.poll_transmit().unwrap();
    assert!(client.poll_transmit().is_none());

    // duplicate of the first packet must not double-deliver
    server.handle_read(&first, now).unwrap();
    server.handle_read(&first, now).unwrap();
    server.handle_read(&third, now).unwrap();
    assert_eq!(received_payloads(&mut server), vec![Bytes::from_static(b"alpha")]);

    // the gap report alone does not trigger recovery, the T3 timer does
    bridge(&mut client, &mut server, now);
    assert!(received_payloads(&mut server).is_empty());

    let deadline = client.poll_timeout().unwrap();
    client.handle_timeout(deadline);
    bridge(&mut client, &mut server, deadline);

    assert_eq!(
        received_payloads(&mut server),
        vec![Bytes::from_static(b"bravo"), Bytes::from_static(b"charlie")]
    );
    // everything acked, no timer left running
    assert!(client.poll_timeout().is_none());
}

#[test]
fn test_unordered_delivery() {
    let (mut client, mut server) = new_pair();
    let now = Instant::now();
    establish(&mut client, &mut server, now);

    client
        .write(3, 51, b"loose", false, ReliabilityPolicy::Reliable, now)
        .unwrap();
    bridge(&mut client, &mut server, now);

    match server.poll_event() {
        Some(AssociationEvent::DataReceived {
            stream_id,
            ppid,
            unordered,
            data,
        }) => {
            assert_eq!(stream_id, 3);
            assert_eq!(ppid, 51);
            assert!(unordered);
            assert_eq!(data, Bytes::from_static(b"loose"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn test_fragmentation_and_reassembly() {
    let (mut client, mut server) = new_pair();
    let now = Instant::now();
    establish(&mut client, &mut server, now);

    let message: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    client
        .write(0, 53, &message, true, ReliabilityPolicy::Reliable, now)
        .unwrap();
    bridge(&mut client, &mut server, now);

    let payloads = received_payloads(&mut server);
    assert_eq!(payloads.len(), 1);
    assert_eq!(&payloads[0][..], &message[..]);
}

#[test]
fn test_partial_reliability_skips_abandoned_message() {
    let (mut client, mut server) = new_pair();
    let now = Instant::now();
    establish(&mut client, &mut server, now);

    client
        .write(0, 53, b"stale", true, ReliabilityPolicy::MaxRetransmits(0), now)
        .unwrap();
    client
        .write(0, 53, b"fresh", true, ReliabilityPolicy::Reliable, now)
        .unwrap();

    // first message is lost on the wire, the second arrives
    let _lost = client.poll_transmit().unwrap();
    let second = client.poll_transmit().unwrap();
    server.handle_read(&second, now).unwrap();
    bridge(&mut client, &mut server, now);
    assert!(received_payloads(&mut server).is_empty());

    // one retransmission is allowed before the limit of zero kicks in
    let deadline = client.poll_timeout().unwrap();
    client.handle_timeout(deadline);
    let _lost_again = client.poll_transmit().unwrap();
    assert!(client.poll_transmit().is_none());

    // second expiry abandons the message and advances the peer past it
    let deadline = client.poll_timeout().unwrap();
    client.handle_timeout(deadline);
    bridge(&mut client, &mut server, deadline);

    assert_eq!(received_payloads(&mut server), vec![Bytes::from_static(b"fresh")]);
    assert!(client.poll_timeout().is_none());
}

#[test]
fn test_unknown_verification_tag_is_dropped() {
    let (mut client, mut server) = new_pair();
    let now = Instant::now();
    establish(&mut client, &mut server, now);

    let stray = Packet {
        source_port: SCTP_PORT,
        destination_port: SCTP_PORT,
        verification_tag: 0xdead_beef,
        chunks: vec![Chunk::Abort("not yours".to_string())],
    }
    .encode();
    server.handle_read(&stray, now).unwrap();

    assert_eq!(server.state(), AssociationState::Established);
    assert!(server.poll_event().is_none());
}

#[test]
fn test_graceful_shutdown() {
    let (mut client, mut server) = new_pair();
    let now = Instant::now();
    establish(&mut client, &mut server, now);

    client.shutdown(now).unwrap();
    bridge(&mut client, &mut server, now);

    assert_eq!(client.state(), AssociationState::Closed);
    assert_eq!(server.state(), AssociationState::Closed);
    assert_eq!(client.poll_event(), Some(AssociationEvent::Closed));
    assert_eq!(server.poll_event(), Some(AssociationEvent::Closed));
}

#[test]
fn test_retransmission_exhaustion_aborts() {
    let config = AssociationConfig {
        max_retransmits: 2,
        ..AssociationConfig::default()
    };
    let (mut client, mut server) = new_pair_with(config);
    let now = Instant::now();
    establish(&mut client, &mut server, now);

    client
        .write(0, 53, b"doomed", true, ReliabilityPolicy::Reliable, now)
        .unwrap();

    // lose every retransmission until the association gives up
    let mut aborted_wire = None;
    for _ in 0..8 {
        while let Some(pkt) = client.poll_transmit() {
            aborted_wire = Some(pkt);
        }
        let Some(deadline) = client.poll_timeout() else {
            break;
        };
        client.handle_timeout(deadline);
    }

    assert_eq!(client.state(), AssociationState::Closed);
    assert!(matches!(
        client.poll_event(),
        Some(AssociationEvent::Aborted(_))
    ));

    // the final packet on the wire is the ABORT, the peer learns too
    let final_now = Instant::now();
    server.handle_read(&aborted_wire.unwrap(), final_now).unwrap();
    assert_eq!(server.state(), AssociationState::Closed);
    assert!(matches!(
        server.poll_event(),
        Some(AssociationEvent::Aborted(_))
    ));
}

#[test]
fn test_write_requires_established() {
    let mut assoc = Association::new(AssociationConfig::default());
    let result = assoc.write(
        0,
        53,
        b"early",
        true,
        ReliabilityPolicy::Reliable,
        Instant::now(),
    );
    assert!(result.is_err());
}
