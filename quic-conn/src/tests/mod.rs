use std::{cell::RefCell, rc::Rc};

use assert_matches::assert_matches;
use bytes::Bytes;
use proptest::{collection::vec, prop_assert, prop_assert_eq};
use test_strategy::proptest;

use crate::{
    AddressChange, CloseSource, ConnectionCloseBehavior, Dir, Duration, EncryptionLevel, Frame,
    KeyUpdateReason, PacketCodec, PathValidationOutcome, QuicErrorCode, RangeSet,
    SendMessageError, Side, SpaceId, StreamId, TransportErrorCode,
    connection::Timer,
    frame::{Close, Crypto, Stream},
};

pub(crate) mod util;
use util::*;

fn stream(offset: u64, data: &'static [u8]) -> Frame {
    Frame::Stream(Stream {
        id: StreamId::new(Side::Client, Dir::Bi, 0),
        offset,
        fin: false,
        data: Bytes::from_static(data),
    })
}

fn crypto(data: &'static [u8]) -> Frame {
    Frame::Crypto(Crypto {
        offset: 0,
        data: Bytes::from_static(data),
    })
}

fn ack_of(number: u64) -> Frame {
    let mut ranges = RangeSet::new();
    ranges.insert_one(number);
    Frame::Ack(crate::Ack::new(ranges, Duration::ZERO).unwrap())
}

fn without_padding(frames: Vec<Frame>) -> Vec<Frame> {
    frames
        .into_iter()
        .filter(|f| !matches!(f, Frame::Padding(_)))
        .collect()
}

/// Every frame in every packet of `sent`
fn frames(h: &Harness, sent: &[Datagram]) -> Vec<Frame> {
    sent.iter()
        .flat_map(|d| h.parse(d))
        .flat_map(|(_, frames)| frames)
        .collect()
}

#[test]
fn client_initial_is_padded() {
    let mut h = Harness::new(Side::Client, test_config());
    let sent = h
        .conn
        .send_crypto_data(EncryptionLevel::Initial, Bytes::from_static(b"client hello"), 0);
    assert_eq!(sent, 12);
    let sent = h.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data.len(), 1200);
    assert_eq!(sent[0].remote, addr(SERVER_ADDR));
    let packets = h.parse(&sent[0]);
    assert_eq!(packets[0].0.level, EncryptionLevel::Initial);
    assert_eq!(packets[0].0.src_cid, Some(h.conn.local_cid()));
}

#[test]
fn handshake_acks_are_coalesced() {
    let mut h = Harness::new(Side::Client, test_config());
    h.conn
        .send_crypto_data(EncryptionLevel::Initial, Bytes::from_static(b"client hello"), 0);
    h.take_sent();

    h.codec.install_keys(EncryptionLevel::Handshake);
    h.conn.on_encryption_keys_available(EncryptionLevel::Handshake);
    h.conn.on_decryption_keys_available(EncryptionLevel::Handshake);
    h.receive(
        vec![
            (EncryptionLevel::Initial, vec![ack_of(0), crypto(b"server hello")]),
            (EncryptionLevel::Handshake, vec![crypto(b"certificate")]),
        ],
        1200,
    );

    let levels = h
        .visitor
        .borrow()
        .crypto
        .iter()
        .map(|(level, _)| *level)
        .collect::<Vec<_>>();
    assert_eq!(levels, [EncryptionLevel::Initial, EncryptionLevel::Handshake]);

    let sent = h.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data.len(), 1200);
    let packets = h.parse(&sent[0]);
    let acked_levels = packets
        .iter()
        .filter(|(_, frames)| frames.iter().any(|f| matches!(f, Frame::Ack(_))))
        .map(|(header, _)| header.level)
        .collect::<Vec<_>>();
    assert_eq!(acked_levels, [EncryptionLevel::Initial, EncryptionLevel::Handshake]);
    assert_eq!(h.conn.stats().coalesced_datagrams_sent, 1);
    // Sending at Handshake retires the Initial keys
    assert!(!h.codec.has_encrypter(EncryptionLevel::Initial));
}

#[test]
fn early_handshake_packet_is_replayed() {
    let mut h = Harness::new(Side::Client, test_config());
    h.conn
        .send_crypto_data(EncryptionLevel::Initial, Bytes::from_static(b"client hello"), 0);
    h.take_sent();

    h.receive(
        vec![
            (EncryptionLevel::Initial, vec![ack_of(0), crypto(b"server hello")]),
            (EncryptionLevel::Handshake, vec![crypto(b"certificate")]),
        ],
        1200,
    );
    assert_eq!(h.conn.stats().undecryptable_packets_received, 1);
    assert_eq!(h.visitor.borrow().crypto.len(), 1);
    h.take_sent();

    h.codec.install_keys(EncryptionLevel::Handshake);
    h.conn.on_encryption_keys_available(EncryptionLevel::Handshake);
    h.conn.on_decryption_keys_available(EncryptionLevel::Handshake);
    let now = h.now();
    assert_eq!(h.conn.poll_timeout(), Some(now));
    h.conn.handle_timeout(now);

    let crypto = h.visitor.borrow().crypto.clone();
    assert_eq!(crypto.len(), 2);
    assert_eq!(crypto[1].0, EncryptionLevel::Handshake);
    let sent = h.take_sent();
    let handshake_acked = sent.iter().flat_map(|d| h.parse(d)).any(|(header, frames)| {
        header.level == EncryptionLevel::Handshake
            && frames.iter().any(|f| matches!(f, Frame::Ack(_)))
    });
    assert!(handshake_acked);
}

#[test]
fn stream_data_before_keys_closes() {
    let mut h = Harness::new(Side::Client, test_config());
    let consumed = h.conn.send_stream_data(
        StreamId::new(Side::Client, Dir::Bi, 0),
        Bytes::from_static(b"early"),
        0,
        false,
    );
    assert_eq!(consumed.bytes_consumed, 0);
    let closed = h.closed();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].code, QuicErrorCode::UnencryptedStreamData);
    assert_eq!(closed[0].origin, CloseSource::Local);
    let sent = h.take_sent();
    assert_matches!(frames(&h, &sent).last(), Some(Frame::Close(Close { application: false, .. })));
}

#[test]
fn unprotected_stream_frame_closes() {
    let mut h = Harness::new(Side::Server, test_config());
    h.receive(vec![(EncryptionLevel::Initial, vec![stream(0, b"sneaky")])], 1200);
    let closed = h.closed();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].code, QuicErrorCode::UnencryptedStreamData);
    assert!(h.visitor.borrow().streams.is_empty());
}

#[test]
fn migration_is_validated_and_throttled() {
    let mut h = Harness::established(Side::Server);
    h.ack_all();
    h.take_sent();

    let new_remote = addr(CLIENT_ADDR2);
    h.receive_from(
        new_remote,
        vec![(EncryptionLevel::ForwardSecure, vec![stream(0, b"moved")])],
        1200,
    );
    assert_eq!(h.visitor.borrow().migrations, [AddressChange::Ipv4ToIpv4]);
    assert_eq!(h.conn.peer_address(), new_remote);
    assert!(!h.conn.is_peer_address_validated());

    let sent = h.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].remote, new_remote);
    assert_eq!(sent[0].data.len(), 1200);
    let token = frames(&h, &sent)
        .into_iter()
        .find_map(|f| match f {
            Frame::PathChallenge(token) => Some(token),
            _ => None,
        })
        .expect("path challenge sent");

    let data = Bytes::from(vec![0xab; 10_000]);
    let id = StreamId::new(Side::Client, Dir::Bi, 0);
    let consumed = h.conn.send_stream_data(id, data.clone(), 0, false);
    assert!(consumed.bytes_consumed < data.len());
    let sent_bytes = 1200
        + h.take_sent()
            .iter()
            .filter(|d| d.remote == new_remote)
            .map(|d| d.data.len())
            .sum::<usize>();
    assert!(sent_bytes <= 3 * 1200, "{sent_bytes} bytes sent to unvalidated address");
    assert!(h.conn.stats().amplification_throttling > 0);

    h.receive_from(
        new_remote,
        vec![(EncryptionLevel::ForwardSecure, vec![Frame::PathResponse(token)])],
        0,
    );
    assert!(h.conn.is_peer_address_validated());
    assert_eq!(h.conn.stats().validated_peer_migrations, 1);

    let offset = consumed.bytes_consumed;
    let rest = h
        .conn
        .send_stream_data(id, data.slice(offset..), offset as u64, false);
    assert!(rest.bytes_consumed > 0);
    assert!(h.take_sent().iter().all(|d| d.remote == new_remote));
}

#[test]
fn legacy_probe_answered_without_migrating() {
    let mut config = test_config();
    config.ietf_frames(false);
    let mut h = Harness::established_with(Side::Server, config);
    let new_remote = addr(CLIENT_ADDR2);
    h.receive_from(
        new_remote,
        vec![(EncryptionLevel::ForwardSecure, vec![Frame::Ping, Frame::Padding(1100)])],
        0,
    );

    assert_eq!(h.conn.peer_address(), addr(CLIENT_ADDR));
    assert!(h.visitor.borrow().migrations.is_empty());
    let sent = h.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].remote, new_remote);
    assert_eq!(sent[0].data.len(), 1350);
    assert_eq!(without_padding(frames(&h, &sent)), [Frame::Ping]);
    let stats = h.conn.stats();
    assert_eq!(stats.connectivity_probes_received, 1);
    assert_eq!(stats.connectivity_probes_sent, 1);
}

#[test]
fn small_connectivity_ping_not_amplified() {
    let mut config = test_config();
    config.ietf_frames(false);
    let mut h = Harness::established_with(Side::Server, config);
    let new_remote = addr(CLIENT_ADDR2);
    let data = h.peer.datagram(
        &h.codec,
        vec![(EncryptionLevel::ForwardSecure, vec![Frame::Ping, Frame::Padding(1)])],
        0,
    );
    let received = data.len();
    h.deliver(new_remote, data);

    let sent = h.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].remote, new_remote);
    assert!(sent[0].data.len() <= 3 * received);
    assert_eq!(without_padding(frames(&h, &sent)), [Frame::Ping]);
    assert_eq!(h.conn.peer_address(), addr(CLIENT_ADDR));
}

#[test]
fn off_path_challenge_validates_without_migrating() {
    let mut h = Harness::established(Side::Server);
    let new_remote = addr(CLIENT_ADDR2);
    let data = h.peer.datagram(
        &h.codec,
        vec![(
            EncryptionLevel::ForwardSecure,
            vec![Frame::PathChallenge(0x77), Frame::Padding(1100)],
        )],
        0,
    );
    let received = data.len();
    h.deliver(new_remote, data);

    assert_eq!(h.conn.peer_address(), addr(CLIENT_ADDR));
    assert!(h.visitor.borrow().migrations.is_empty());
    assert_eq!(h.conn.stats().connectivity_probes_received, 1);
    let sent: Vec<_> = h
        .take_sent()
        .into_iter()
        .filter(|d| d.remote == new_remote)
        .collect();
    let total: usize = sent.iter().map(|d| d.data.len()).sum();
    assert!(total <= 3 * received);
    // Padding the challenge needs the bytes counted on the new path
    assert!(sent.iter().all(|d| d.data.len() >= 1200));
    let sent_frames = frames(&h, &sent);
    assert!(sent_frames.contains(&Frame::PathResponse(0x77)));
    assert!(sent_frames
        .iter()
        .any(|f| matches!(f, Frame::PathChallenge(_))));
}

#[test]
fn path_challenge_answered() {
    let mut h = Harness::established(Side::Server);
    h.receive(
        vec![(EncryptionLevel::ForwardSecure, vec![Frame::PathChallenge(0x1234)])],
        0,
    );
    let sent = h.take_sent();
    assert!(sent.iter().all(|d| d.remote == addr(CLIENT_ADDR)));
    assert!(frames(&h, &sent).contains(&Frame::PathResponse(0x1234)));
}

#[test]
fn application_validates_path() {
    let mut h = Harness::established(Side::Client);
    h.ack_all();
    h.take_sent();
    let outcomes = Outcomes::default();
    let local = addr("203.0.113.9:50002");
    let remote = h.remote;
    h.conn
        .validate_path(local, remote, Box::new(TestDelegate(outcomes.clone())));
    let sent = h.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].local, local);
    let token = frames(&h, &sent)
        .into_iter()
        .find_map(|f| match f {
            Frame::PathChallenge(token) => Some(token),
            _ => None,
        })
        .expect("path challenge sent");
    assert!(outcomes.borrow().is_empty());

    let data = h.peer.datagram(
        &h.codec,
        vec![(EncryptionLevel::ForwardSecure, vec![Frame::PathResponse(token)])],
        0,
    );
    h.conn.process_udp_packet(local, remote, data);
    assert_eq!(
        *outcomes.borrow(),
        [(local, remote, PathValidationOutcome::Validated)]
    );
}

#[test]
fn path_validation_cancelled_without_keys() {
    let mut h = Harness::new(Side::Client, test_config());
    let outcomes: Outcomes = Rc::new(RefCell::new(Vec::new()));
    let (local, remote) = (h.local, h.remote);
    h.conn
        .validate_path(local, remote, Box::new(TestDelegate(outcomes.clone())));
    assert_eq!(
        *outcomes.borrow(),
        [(local, remote, PathValidationOutcome::Cancelled)]
    );
    assert!(h.take_sent().is_empty());
}

#[test]
fn quiescent_rto_keeps_blackhole_timer_off() {
    let mut h = Harness::established(Side::Server);
    assert!(h.conn.armed_timers().contains(&Timer::NetworkBlackhole));
    h.clock.advance(Duration::from_millis(20));
    h.ack_all();
    assert!(!h.conn.armed_timers().contains(&Timer::NetworkBlackhole));
    h.take_sent();

    for _ in 0..3 {
        let now = h.now();
        h.conn.on_retransmission_timeout(now);
        assert!(!h.conn.armed_timers().contains(&Timer::NetworkBlackhole));
    }
    assert!(h.take_sent().is_empty());
    assert_eq!(h.conn.stats().pto_count, 0);
    assert!(h.conn.is_connected());
}

#[test]
fn pto_probes_unacked_data() {
    let mut h = Harness::established(Side::Server);
    let id = StreamId::new(Side::Client, Dir::Bi, 0);
    let consumed = h
        .conn
        .send_stream_data(id, Bytes::from_static(&[1; 100]), 0, false);
    assert_eq!(consumed.bytes_consumed, 100);
    h.take_sent();

    let before = h.now();
    let deadline = h.fire_next_timeout().unwrap();
    assert!(deadline > before);
    assert_eq!(h.conn.stats().pto_count, 1);
    let sent = h.take_sent();
    assert!(!sent.is_empty());
    let retransmitted = frames(&h, &sent).into_iter().any(|f| {
        matches!(f, Frame::Stream(Stream { offset: 0, ref data, .. }) if data.len() == 100)
    });
    assert!(retransmitted);
    // A packet number is skipped before probing
    let numbers = sent
        .iter()
        .flat_map(|d| h.parse(d))
        .map(|(header, _)| header.number)
        .collect::<Vec<_>>();
    assert!(!numbers.contains(&2));
}

#[test]
fn handshake_timeout_closes() {
    let mut h = Harness::new(Side::Client, test_config());
    let start = h.now();
    h.fire_next_timeout().unwrap();
    assert_eq!(h.now() - start, Duration::from_secs(10));
    let closed = h.closed();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].code, QuicErrorCode::HandshakeTimeout);
    assert!(!h.conn.is_connected());
}

#[test]
fn idle_timeout_closes_silently() {
    let mut h = Harness::established(Side::Server);
    h.ack_all();
    h.take_sent();
    for _ in 0..50 {
        if !h.conn.is_connected() {
            break;
        }
        h.fire_next_timeout().unwrap();
    }
    let closed = h.closed();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].code, QuicErrorCode::NetworkIdleTimeout);
    assert!(h.take_sent().is_empty());
    assert_eq!(h.conn.poll_timeout(), None);
}

#[test]
fn close_is_idempotent() {
    let mut h = Harness::established(Side::Server);
    h.conn.close_connection(
        QuicErrorCode::Application(7),
        "bye",
        ConnectionCloseBehavior::SendConnectionClosePacket,
    );
    h.conn.close_connection(
        QuicErrorCode::InternalError,
        "again",
        ConnectionCloseBehavior::SendConnectionClosePacket,
    );
    h.receive(
        vec![(
            EncryptionLevel::ForwardSecure,
            vec![Frame::Close(Close {
                error_code: 0,
                frame_type: None,
                reason: Bytes::new(),
                application: false,
            })],
        )],
        0,
    );

    let closed = h.closed();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].code, QuicErrorCode::Application(7));
    let sent = h.take_sent();
    assert_eq!(sent.len(), 1);
    assert_matches!(
        frames(&h, &sent).last(),
        Some(Frame::Close(Close { application: true, error_code: 7, .. }))
    );
    assert_eq!(h.conn.poll_timeout(), None);
}

#[test]
fn peer_close_reported() {
    let mut h = Harness::established(Side::Server);
    h.receive(
        vec![(
            EncryptionLevel::ForwardSecure,
            vec![Frame::Close(Close {
                error_code: TransportErrorCode::PROTOCOL_VIOLATION.into(),
                frame_type: None,
                reason: Bytes::from_static(b"nope"),
                application: false,
            })],
        )],
        0,
    );
    let closed = h.closed();
    assert_eq!(closed.len(), 1);
    assert_eq!(
        closed[0].code,
        QuicErrorCode::Transport(TransportErrorCode::PROTOCOL_VIOLATION)
    );
    assert_eq!(closed[0].origin, CloseSource::Peer);
    assert!(h.take_sent().is_empty());
    assert!(!h.conn.is_connected());
}

#[test]
fn duplicate_packet_dropped() {
    let mut h = Harness::established(Side::Server);
    let data = h.peer.datagram(
        &h.codec,
        vec![(EncryptionLevel::ForwardSecure, vec![stream(0, b"once")])],
        0,
    );
    h.deliver(h.remote, data.clone());
    h.deliver(h.remote, data);
    assert_eq!(h.visitor.borrow().streams.len(), 1);
    assert_eq!(h.conn.stats().duplicate_packets_dropped, 1);
}

#[test]
fn messages() {
    let mut h = Harness::new(Side::Client, test_config());
    assert_eq!(
        h.conn.send_message(Bytes::from_static(b"hi")),
        Err(SendMessageError::EncryptionNotEstablished)
    );

    let mut h = Harness::established(Side::Client);
    assert_eq!(
        h.conn.send_message(Bytes::from(vec![0; 2000])),
        Err(SendMessageError::TooLarge)
    );
    assert_eq!(h.conn.send_message(Bytes::from_static(b"hi")), Ok(()));
    let sent = h.take_sent();
    assert!(frames(&h, &sent).contains(&Frame::Message(Bytes::from_static(b"hi"))));

    h.receive(
        vec![(
            EncryptionLevel::ForwardSecure,
            vec![Frame::Message(Bytes::from_static(b"yo"))],
        )],
        0,
    );
    assert_eq!(h.visitor.borrow().messages, [Bytes::from_static(b"yo")]);
}

#[test]
fn blocked_writer_resumes() {
    let mut h = Harness::established(Side::Server);
    let id = StreamId::new(Side::Client, Dir::Bi, 0);
    h.writer
        .borrow_mut()
        .script
        .push_back(crate::WriteResult::Blocked);

    let consumed = h
        .conn
        .send_stream_data(id, Bytes::from_static(b"hello"), 0, false);
    assert_eq!(consumed.bytes_consumed, 5);
    assert_eq!(h.visitor.borrow().write_blocked, 1);
    assert!(h.take_sent().is_empty());

    let more = h
        .conn
        .send_stream_data(id, Bytes::from_static(b"world"), 5, false);
    assert_eq!(more.bytes_consumed, 0);

    h.conn.on_blocked_writer_can_write();
    let sent = h.take_sent();
    assert_eq!(sent.len(), 1);
    assert!(frames(&h, &sent)
        .iter()
        .any(|f| matches!(f, Frame::Stream(s) if s.data == Bytes::from_static(b"hello"))));
}

#[test]
fn confidentiality_limit_closes() {
    let mut config = test_config();
    config.key_update_supported(false);
    let mut h = Harness::established_with(Side::Server, config);
    h.codec.set_confidentiality_limit(10);

    for _ in 0..20 {
        if !h.conn.is_connected() {
            break;
        }
        h.conn.send_ping();
    }
    let closed = h.closed();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].code, QuicErrorCode::AeadLimitReached);
    assert_eq!(closed[0].origin, CloseSource::Local);

    let sent = h.take_sent();
    assert_eq!(sent.len(), 9);
    assert_matches!(
        frames(&h, &sent[8..]).last(),
        Some(Frame::Close(Close { application: false, .. }))
    );
}

#[test]
fn confidentiality_limit_updates_keys() {
    let mut config = test_config();
    config.key_update_offset(5);
    let mut h = Harness::established_with(Side::Server, config);
    h.codec.set_confidentiality_limit(10);
    h.clock.advance(Duration::from_millis(10));
    h.ack_all();
    h.take_sent();

    for _ in 0..8 {
        h.conn.send_ping();
    }
    assert!(h.conn.is_connected());
    assert_eq!(
        h.visitor.borrow().key_updates,
        [KeyUpdateReason::LocalAeadConfidentialityLimit]
    );
    assert_eq!(h.codec.key_updates(), 1);
    assert_eq!(h.conn.stats().key_updates, 1);

    let sent = h.take_sent();
    let (header, _) = h.parse(sent.last().unwrap()).remove(0);
    assert!(header.key_phase);

    let deadline = h
        .conn
        .timer_deadline(Timer::DiscardPreviousOneRttKeys)
        .expect("previous keys still held");
    h.clock.set(deadline);
    h.conn.handle_timeout(deadline);
    assert_eq!(h.codec.previous_keys_discarded(), 1);
}

#[test]
fn late_packets_after_local_key_update() {
    let mut h = Harness::established(Side::Server);
    h.conn.send_ping();
    h.clock.advance(Duration::from_millis(10));
    h.ack_all();
    assert!(h.conn.initiate_key_update(KeyUpdateReason::LocalForTests));
    assert_eq!(h.codec.key_updates(), 1);
    h.take_sent();

    let fs = EncryptionLevel::ForwardSecure;
    let late = h.peer.datagram(&h.codec, vec![(fs, vec![stream(0, b"a")])], 0);
    h.receive(vec![(fs, vec![stream(1, b"b")])], 0);
    assert_eq!(h.codec.key_updates(), 1);

    h.peer.key_phase = true;
    h.receive(vec![(fs, vec![stream(2, b"c")])], 0);
    h.deliver(h.remote, late);
    assert_eq!(h.codec.key_updates(), 1);
    assert_eq!(h.conn.stats().key_updates, 1);
    assert_eq!(h.visitor.borrow().streams.len(), 3);

    // The peer moving on from the new phase is an update of its own
    h.peer.key_phase = false;
    h.receive(vec![(fs, vec![stream(3, b"d")])], 0);
    assert_eq!(h.codec.key_updates(), 2);
    assert_eq!(
        h.visitor.borrow().key_updates,
        [KeyUpdateReason::LocalForTests, KeyUpdateReason::Remote]
    );
    assert!(h.conn.is_connected());
}

#[test]
fn integrity_limit_closes() {
    let mut h = Harness::established(Side::Server);
    h.codec.set_integrity_limit(2);
    for _ in 0..2 {
        let mut buf = Vec::new();
        h.codec.forge(EncryptionLevel::ForwardSecure, 60, &mut buf);
        h.deliver(h.remote, buf.into());
    }
    let closed = h.closed();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].code, QuicErrorCode::AeadLimitReached);
    assert_eq!(h.conn.stats().failed_authentication_packets, 2);
}

#[test]
fn acking_unsent_packet_closes() {
    let mut h = Harness::established(Side::Server);
    let mut ranges = RangeSet::new();
    ranges.insert(0..10);
    h.ack(ranges);
    let closed = h.closed();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].code, QuicErrorCode::InvalidAckData);
}

#[proptest(cases = 32)]
fn random_acks_never_grow_outstanding(
    #[strategy(1usize..20)] pings: usize,
    #[strategy(vec((0u64..40, 1u64..5), 1..8))] acks: Vec<(u64, u64)>,
) {
    let mut h = Harness::established(Side::Server);
    h.ack_all();
    for _ in 0..pings {
        h.conn.send_ping();
    }
    let largest = h.conn.largest_sent(SpaceId::Data).unwrap();
    for (start, len) in acks {
        let start = start % (largest + 1);
        let end = (start + len).min(largest + 1);
        let mut ranges = RangeSet::new();
        ranges.insert(start..end);
        let before = h.conn.outstanding_packets();
        h.ack(ranges);
        prop_assert!(h.conn.outstanding_packets() <= before);
        prop_assert!(h.conn.is_connected());
    }
}

#[proptest(cases = 32)]
fn duplicates_processed_once(
    #[strategy(1usize..16)] count: usize,
    #[strategy(vec(0usize..64, 1..40))] order: Vec<usize>,
) {
    let mut h = Harness::established(Side::Server);
    let fs = EncryptionLevel::ForwardSecure;
    let datagrams: Vec<Bytes> = (0..count)
        .map(|i| h.peer.datagram(&h.codec, vec![(fs, vec![stream(i as u64, b"x")])], 0))
        .collect();
    let before = h.conn.stats().duplicate_packets_dropped;
    let mut seen = std::collections::HashSet::new();
    for &i in &order {
        let i = i % count;
        seen.insert(i);
        h.deliver(h.remote, datagrams[i].clone());
    }
    prop_assert!(h.conn.is_connected());
    prop_assert_eq!(h.visitor.borrow().streams.len(), seen.len());
    prop_assert_eq!(
        h.conn.stats().duplicate_packets_dropped - before,
        (order.len() - seen.len()) as u64
    );
}

#[proptest(cases = 32)]
fn unvalidated_address_never_amplified(
    ietf: bool,
    #[strategy(vec(0usize..1300, 1..6))] paddings: Vec<usize>,
) {
    let mut config = test_config();
    config.ietf_frames(ietf);
    let mut h = Harness::established_with(Side::Server, config);
    let new_remote = addr(CLIENT_ADDR2);
    let mut received = 0;
    let mut sent = 0;
    for (i, padding) in paddings.into_iter().enumerate() {
        let frames = match ietf {
            true if padding == 0 => vec![Frame::PathChallenge(i as u64)],
            true => vec![Frame::PathChallenge(i as u64), Frame::Padding(padding)],
            false => vec![Frame::Ping, Frame::Padding(padding.max(1))],
        };
        let data = h
            .peer
            .datagram(&h.codec, vec![(EncryptionLevel::ForwardSecure, frames)], 0);
        received += data.len();
        h.deliver(new_remote, data);
        for _ in 0..2 {
            h.fire_next_timeout();
        }
        sent += h
            .take_sent()
            .iter()
            .filter(|d| d.remote == new_remote)
            .map(|d| d.data.len())
            .sum::<usize>();
        prop_assert!(sent <= 3 * received, "sent {sent} for {received} received");
    }
    prop_assert_eq!(h.conn.peer_address(), addr(CLIENT_ADDR));
}
