use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Instant;

use oxrtc::{
    DataChannelConfig, DataChannelPayload, MediaKind, PeerConnection, PeerConnectionConfig,
    PeerConnectionEvent,
};
use shared::error::Result;
use shared::TaggedBytesMut;

fn new_peer(base_port: u16) -> Result<PeerConnection> {
    let local_addr: SocketAddr = format!("127.0.0.1:{base_port}").parse().unwrap();
    PeerConnection::new(PeerConnectionConfig {
        certificate: None,
        local_addr,
    })
}

fn negotiate(a: &mut PeerConnection, b: &mut PeerConnection, now: Instant) -> Result<()> {
    let offer = a.create_offer()?;
    a.set_local_description(offer.clone(), now)?;
    b.set_remote_description(offer, now)?;
    let answer = b.create_answer()?;
    b.set_local_description(answer.clone(), now)?;
    a.set_remote_description(answer, now)?;
    Ok(())
}

/// Forwards one datagram, re-tagging it from the receiver's viewpoint.
fn deliver(to: &mut PeerConnection, mut msg: TaggedBytesMut, now: Instant) {
    std::mem::swap(&mut msg.transport.local_addr, &mut msg.transport.peer_addr);
    msg.now = now;
    let _ = to.handle_read(msg);
}

fn shuttle(
    a: &mut PeerConnection,
    b: &mut PeerConnection,
    now: Instant,
    a_events: &mut Vec<PeerConnectionEvent>,
    b_events: &mut Vec<PeerConnectionEvent>,
) {
    loop {
        let mut moved = false;
        while let Some(msg) = a.poll_transmit() {
            deliver(b, msg, now);
            moved = true;
        }
        while let Some(msg) = b.poll_transmit() {
            deliver(a, msg, now);
            moved = true;
        }
        if !moved {
            break;
        }
    }
    while let Some(event) = a.poll_event() {
        a_events.push(event);
    }
    while let Some(event) = b.poll_event() {
        b_events.push(event);
    }
}

/// Exchanges traffic and advances the simulated clock until `done`
/// reports success or the iteration budget runs out.
fn drive(
    a: &mut PeerConnection,
    b: &mut PeerConnection,
    now: &mut Instant,
    a_events: &mut Vec<PeerConnectionEvent>,
    b_events: &mut Vec<PeerConnectionEvent>,
    mut done: impl FnMut(&PeerConnection, &PeerConnection, &[PeerConnectionEvent], &[PeerConnectionEvent]) -> bool,
) -> bool {
    for _ in 0..1000 {
        shuttle(a, b, *now, a_events, b_events);
        if done(a, b, a_events, b_events) {
            return true;
        }
        let deadline = match (a.poll_timeout(), b.poll_timeout()) {
            (Some(x), Some(y)) => x.min(y),
            (Some(x), None) | (None, Some(x)) => x,
            (None, None) => return false,
        };
        if deadline > *now {
            *now = deadline;
        }
        a.handle_timeout(*now);
        b.handle_timeout(*now);
    }
    false
}

fn connect(
    a: &mut PeerConnection,
    b: &mut PeerConnection,
    now: &mut Instant,
    a_events: &mut Vec<PeerConnectionEvent>,
    b_events: &mut Vec<PeerConnectionEvent>,
) {
    let connected = drive(a, b, now, a_events, b_events, |a, b, _, _| {
        a.is_connected() && b.is_connected()
    });
    assert!(connected, "dtls handshakes did not complete");
    assert!(matches!(
        a.ice_connection_state(),
        oxrtc::ConnectionState::Connected | oxrtc::ConnectionState::Completed
    ));
    assert!(matches!(
        b.ice_connection_state(),
        oxrtc::ConnectionState::Connected | oxrtc::ConnectionState::Completed
    ));
}

fn count_rtp(events: &[PeerConnectionEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, PeerConnectionEvent::RtpReceived(_)))
        .count()
}

#[test]
fn test_audio_stream_end_to_end() -> Result<()> {
    let _ = env_logger::try_init();
    let mut now = Instant::now();
    let mut a = new_peer(4000)?;
    let mut b = new_peer(5000)?;
    a.add_media_section(MediaKind::Audio, 111, "opus/48000/2", 48000)?;

    negotiate(&mut a, &mut b, now)?;
    let (mut a_events, mut b_events) = (vec![], vec![]);
    connect(&mut a, &mut b, &mut now, &mut a_events, &mut b_events);

    for i in 0..5u32 {
        a.write_rtp("0", i * 960, i == 0, Bytes::from(vec![i as u8; 160]), now)?;
    }
    let all_received = drive(
        &mut a,
        &mut b,
        &mut now,
        &mut a_events,
        &mut b_events,
        |_, _, _, b_events| count_rtp(b_events) >= 5,
    );
    assert!(all_received, "expected 5 rtp packets at the receiver");

    let mut sequence_numbers = vec![];
    let mut payload_marks = vec![];
    for event in &b_events {
        if let PeerConnectionEvent::RtpReceived(packet) = event {
            sequence_numbers.push(packet.header.sequence_number);
            payload_marks.push(packet.payload[0]);
        }
    }
    assert_eq!(5, sequence_numbers.len());
    for window in sequence_numbers.windows(2) {
        assert_eq!(window[0].wrapping_add(1), window[1]);
    }
    assert_eq!(vec![0, 1, 2, 3, 4], payload_marks);

    a.close(now);
    b.close(now);
    Ok(())
}

#[test]
fn test_data_channel_end_to_end() -> Result<()> {
    let _ = env_logger::try_init();
    let mut now = Instant::now();
    let mut a = new_peer(4100)?;
    let mut b = new_peer(5100)?;
    a.create_data_channel(DataChannelConfig {
        label: "chat".to_string(),
        ..Default::default()
    })?;

    negotiate(&mut a, &mut b, now)?;
    let (mut a_events, mut b_events) = (vec![], vec![]);
    connect(&mut a, &mut b, &mut now, &mut a_events, &mut b_events);

    // the channel is open once the opener sees the DCEP ack
    let opened = drive(
        &mut a,
        &mut b,
        &mut now,
        &mut a_events,
        &mut b_events,
        |_, _, a_events, _| {
            a_events
                .iter()
                .any(|e| matches!(e, PeerConnectionEvent::DataChannelOpened(label) if label == "chat"))
        },
    );
    assert!(opened, "data channel never opened");
    assert!(b_events
        .iter()
        .any(|e| matches!(e, PeerConnectionEvent::DataChannelOpened(label) if label == "chat")));

    for _ in 0..3 {
        a.send(
            "chat",
            DataChannelPayload::Binary(Bytes::from_static(b"ping")),
            now,
        )?;
    }
    let delivered = drive(
        &mut a,
        &mut b,
        &mut now,
        &mut a_events,
        &mut b_events,
        |_, _, _, b_events| {
            b_events
                .iter()
                .filter(|e| matches!(e, PeerConnectionEvent::DataChannelMessage { .. }))
                .count()
                >= 3
        },
    );
    assert!(delivered, "expected 3 deliveries");

    let messages: Vec<_> = b_events
        .iter()
        .filter_map(|e| match e {
            PeerConnectionEvent::DataChannelMessage { label, payload } => {
                Some((label.clone(), payload))
            }
            _ => None,
        })
        .collect();
    assert_eq!(3, messages.len());
    for (label, payload) in &messages {
        assert_eq!("chat", label);
        match payload {
            DataChannelPayload::Binary(data) => assert_eq!(&b"ping"[..], &data[..]),
            DataChannelPayload::Text(_) => panic!("expected binary payload"),
        }
    }

    a.close(now);
    b.close(now);
    Ok(())
}

#[test]
fn test_negotiation_requires_remote_offer() -> Result<()> {
    let mut b = new_peer(5200)?;
    assert!(b.create_answer().is_err());
    Ok(())
}

#[test]
fn test_offer_with_nothing_to_negotiate_fails() -> Result<()> {
    let mut a = new_peer(4300)?;
    assert!(a.create_offer().is_err());
    Ok(())
}

#[test]
fn test_rejected_section_in_answer_is_tolerated() -> Result<()> {
    let now = Instant::now();
    let mut a = new_peer(4500)?;
    a.add_media_section(MediaKind::Audio, 111, "opus/48000/2", 48000)?;
    let offer = a.create_offer()?;
    a.set_local_description(offer, now)?;

    let rejected = "v=0\r\n\
o=- 0 0 IN IP4 0.0.0.0\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 0 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n";
    a.set_remote_description(
        oxrtc::RTCSessionDescription::answer(rejected.to_string()),
        now,
    )?;
    assert_eq!(oxrtc::SignalingState::Stable, a.signaling_state());
    assert!(!a.is_connected());
    Ok(())
}

#[test]
fn test_offer_overflowing_local_port_range_is_rejected() -> Result<()> {
    let now = Instant::now();
    let mut a = new_peer(4600)?;
    a.add_media_section(MediaKind::Audio, 111, "opus/48000/2", 48000)?;
    a.create_data_channel(DataChannelConfig {
        label: "chat".to_string(),
        ..Default::default()
    })?;
    let offer = a.create_offer()?;
    a.set_local_description(offer.clone(), now)?;

    // The second section would need port 65536.
    let mut b = new_peer(65535)?;
    assert!(b.set_remote_description(offer, now).is_err());
    Ok(())
}

#[test]
fn test_close_makes_negotiation_fail() -> Result<()> {
    let now = Instant::now();
    let mut a = new_peer(4400)?;
    a.add_media_section(MediaKind::Audio, 111, "opus/48000/2", 48000)?;
    let _ = a.create_offer()?;
    a.close(now);
    assert!(a.create_offer().is_err());
    assert_eq!(oxrtc::SignalingState::Closed, a.signaling_state());
    Ok(())
}
