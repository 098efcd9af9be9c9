use std::{
    cell::RefCell,
    collections::VecDeque,
    net::SocketAddr,
    rc::Rc,
    sync::{Arc, Mutex},
};

use bytes::{BufMut, Bytes};
use hex_literal::hex;
use rustc_hash::FxHashMap;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::{
    AddressChange, Connection, ConnectionConfig, ConnectionError, Duration, EncryptionLevel,
    HandshakeState, Instant, KeyUpdateReason, PathValidationDelegate, PathValidationOutcome,
    Side, SpaceId, Visitor,
    clock::Clock,
    frame::{Ack, Crypto, Frame, Stream},
    packet::{
        DecodeContext, DecodeError, Decoded, DecodedPacket, EncodeError, PacketCodec,
        PacketHeader,
    },
    range_set::RangeSet,
    shared::ConnectionId,
    writer::{PacketWriter, WriteResult},
};

pub(crate) fn subscribe() -> DefaultGuard {
    let sub = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(sub)
}

/// The ID the connection under test is addressed with
pub(crate) const LOCAL_CID: [u8; 8] = hex!("0a0b0c0d0e0f1011");
/// The ID its peer is addressed with
pub(crate) const PEER_CID: [u8; 8] = hex!("f0e0d0c0b0a09080");

pub(crate) const SERVER_ADDR: &str = "192.0.2.1:443";
pub(crate) const CLIENT_ADDR: &str = "203.0.113.9:50000";
/// Where a migrating client shows up next
pub(crate) const CLIENT_ADDR2: &str = "198.51.100.7:50001";

pub(crate) fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// Tag bit marking a packet that fails authentication
const FORGED: u8 = 0x80;
/// Level tag, length, and registry ID
const HEADER_LEN: usize = 11;
const AEAD_TAG_LEN: usize = 16;

/// A packet codec that never actually protects anything
///
/// Encoded packets carry their level, their length and an ID under which the header and
/// frames are kept in a shared registry. Entries are never removed, so the same bytes decode
/// again when replayed. Clones share state, so a test can keep a handle to the codec it gave to
/// a connection.
#[derive(Clone, Default)]
pub(crate) struct TestCodec(Arc<Mutex<CodecState>>);

#[derive(Default)]
struct CodecState {
    encrypters: [bool; 4],
    decrypters: [bool; 4],
    next_id: u64,
    registry: FxHashMap<u64, (PacketHeader, Vec<Frame>)>,
    confidentiality_limit: Option<u64>,
    integrity_limit: Option<u64>,
    refuse_key_update: bool,
    key_updates: u64,
    previous_keys_discarded: u64,
}

impl CodecState {
    fn register(&mut self, header: PacketHeader, frames: Vec<Frame>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.registry.insert(id, (header, frames));
        id
    }
}

impl TestCodec {
    pub(crate) fn install_keys(&self, level: EncryptionLevel) {
        let mut state = self.0.lock().unwrap();
        state.encrypters[level as usize] = true;
        state.decrypters[level as usize] = true;
    }

    pub(crate) fn set_confidentiality_limit(&self, limit: u64) {
        self.0.lock().unwrap().confidentiality_limit = Some(limit);
    }

    pub(crate) fn set_integrity_limit(&self, limit: u64) {
        self.0.lock().unwrap().integrity_limit = Some(limit);
    }

    pub(crate) fn refuse_key_updates(&self) {
        self.0.lock().unwrap().refuse_key_update = true;
    }

    pub(crate) fn key_updates(&self) -> u64 {
        self.0.lock().unwrap().key_updates
    }

    pub(crate) fn previous_keys_discarded(&self) -> u64 {
        self.0.lock().unwrap().previous_keys_discarded
    }

    /// Append a packet to `buf` without any key checks, padded to `min_size`
    pub(crate) fn build(
        &self,
        header: PacketHeader,
        frames: Vec<Frame>,
        min_size: usize,
        buf: &mut Vec<u8>,
    ) -> usize {
        let len = self.encoded_len(&header, &frames, min_size);
        let tag = header.level as u8;
        let id = self.0.lock().unwrap().register(header, frames);
        write_packet(buf, tag, len, id);
        len
    }

    /// Append a packet at `level` that fails authentication
    pub(crate) fn forge(&self, level: EncryptionLevel, len: usize, buf: &mut Vec<u8>) {
        let id = u64::MAX;
        write_packet(buf, FORGED | level as u8, len.max(HEADER_LEN), id);
    }

    /// Decode every packet of a datagram, regardless of installed keys
    pub(crate) fn parse(&self, mut data: &[u8]) -> Vec<(PacketHeader, Vec<Frame>)> {
        let state = self.0.lock().unwrap();
        let mut packets = Vec::new();
        while data.len() >= HEADER_LEN {
            let len = usize::from(u16::from_be_bytes([data[1], data[2]]));
            let id = u64::from_be_bytes(data[3..11].try_into().unwrap());
            packets.push(state.registry[&id].clone());
            data = &data[len..];
        }
        packets
    }

    fn encoded_len(&self, header: &PacketHeader, frames: &[Frame], min_size: usize) -> usize {
        let len = self.packet_overhead(header.level, header.dst_cid.len())
            + frames.iter().map(|f| self.frame_size(f)).sum::<usize>();
        len.max(min_size)
    }
}

fn write_packet(buf: &mut Vec<u8>, tag: u8, len: usize, id: u64) {
    let start = buf.len();
    buf.put_u8(tag);
    buf.put_u16(len as u16);
    buf.put_u64(id);
    buf.resize(start + len, 0);
}

fn level_from_tag(tag: u8) -> Option<EncryptionLevel> {
    EncryptionLevel::ALL.into_iter().find(|&level| level as u8 == tag)
}

impl PacketCodec for TestCodec {
    fn decode(&mut self, data: Bytes, _ctx: &DecodeContext) -> Decoded {
        let malformed = |reason| Decoded {
            packet: Err(DecodeError::Malformed(reason)),
            remainder: None,
        };
        if data.len() < HEADER_LEN {
            return malformed("short packet");
        }
        let len = usize::from(u16::from_be_bytes([data[1], data[2]]));
        if len < HEADER_LEN || len > data.len() {
            return malformed("bad length");
        }
        let Some(level) = level_from_tag(data[0] & !FORGED) else {
            return malformed("unknown level");
        };
        let id = u64::from_be_bytes(data[3..11].try_into().unwrap());
        let remainder = (len < data.len()).then(|| data.slice(len..));

        let state = self.0.lock().unwrap();
        let packet = if !state.decrypters[level as usize] {
            Err(DecodeError::KeysUnavailable {
                level,
                packet: data.slice(..len),
            })
        } else if data[0] & FORGED != 0 {
            Err(DecodeError::AuthenticationFailed(level))
        } else {
            match state.registry.get(&id) {
                Some((header, frames)) => Ok(DecodedPacket {
                    header: header.clone(),
                    frames: frames.clone(),
                    size: len,
                }),
                None => Err(DecodeError::Malformed("unknown packet")),
            }
        };
        Decoded { packet, remainder }
    }

    fn encode(
        &mut self,
        header: &PacketHeader,
        frames: &[Frame],
        min_size: usize,
        buf: &mut Vec<u8>,
    ) -> Result<usize, EncodeError> {
        let len = self.encoded_len(header, frames, min_size);
        let mut state = self.0.lock().unwrap();
        if !state.encrypters[header.level as usize] {
            return Err(EncodeError::NoEncrypter(header.level));
        }
        if len > usize::from(u16::MAX) {
            return Err(EncodeError::TooLarge {
                needed: len,
                limit: usize::from(u16::MAX),
            });
        }
        let id = state.register(header.clone(), frames.to_vec());
        write_packet(buf, header.level as u8, len, id);
        Ok(len)
    }

    fn frame_size(&self, frame: &Frame) -> usize {
        match frame {
            Frame::Stream(stream) => 8 + stream.data.len(),
            Frame::Crypto(crypto) => 8 + crypto.data.len(),
            Frame::Padding(n) => *n,
            Frame::Message(data) => 3 + data.len(),
            Frame::Ack(_) => 16,
            _ => 9,
        }
    }

    fn packet_overhead(&self, _level: EncryptionLevel, dst_cid_len: usize) -> usize {
        HEADER_LEN + dst_cid_len + AEAD_TAG_LEN
    }

    fn has_encrypter(&self, level: EncryptionLevel) -> bool {
        self.0.lock().unwrap().encrypters[level as usize]
    }

    fn has_decrypter(&self, level: EncryptionLevel) -> bool {
        self.0.lock().unwrap().decrypters[level as usize]
    }

    fn remove_keys(&mut self, level: EncryptionLevel) {
        let mut state = self.0.lock().unwrap();
        state.encrypters[level as usize] = false;
        state.decrypters[level as usize] = false;
    }

    fn confidentiality_limit(&self) -> u64 {
        self.0.lock().unwrap().confidentiality_limit.unwrap_or(1 << 23)
    }

    fn integrity_limit(&self) -> u64 {
        self.0.lock().unwrap().integrity_limit.unwrap_or(1 << 36)
    }

    fn update_keys(&mut self) -> bool {
        let mut state = self.0.lock().unwrap();
        if state.refuse_key_update {
            return false;
        }
        state.key_updates += 1;
        true
    }

    fn discard_previous_one_rtt_keys(&mut self) {
        self.0.lock().unwrap().previous_keys_discarded += 1;
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ManualClock(Arc<Mutex<Instant>>);

impl ManualClock {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    pub(crate) fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }

    pub(crate) fn set(&self, to: Instant) {
        let mut now = self.0.lock().unwrap();
        assert!(to >= *now, "time never goes backwards");
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.0.lock().unwrap()
    }
}

/// A datagram handed to the writer
#[derive(Debug, Clone)]
pub(crate) struct Datagram {
    pub(crate) data: Vec<u8>,
    pub(crate) local: SocketAddr,
    pub(crate) remote: SocketAddr,
}

#[derive(Debug, Default)]
pub(crate) struct WriterState {
    pub(crate) sent: Vec<Datagram>,
    pub(crate) blocked: bool,
    /// Results returned instead of accepting the next writes
    pub(crate) script: VecDeque<WriteResult>,
}

pub(crate) struct TestWriter(pub(crate) Rc<RefCell<WriterState>>);

impl PacketWriter for TestWriter {
    fn write(&mut self, buf: &[u8], self_addr: SocketAddr, peer_addr: SocketAddr) -> WriteResult {
        let mut state = self.0.borrow_mut();
        if state.blocked {
            return WriteResult::Blocked;
        }
        if let Some(result) = state.script.pop_front() {
            state.blocked = result.is_blocked();
            if result != WriteResult::BlockedDataBuffered {
                return result;
            }
        } else {
            state.blocked = false;
        }
        state.sent.push(Datagram {
            data: buf.to_vec(),
            local: self_addr,
            remote: peer_addr,
        });
        match state.blocked {
            true => WriteResult::BlockedDataBuffered,
            false => WriteResult::Ok(buf.len()),
        }
    }

    fn is_write_blocked(&self) -> bool {
        self.0.borrow().blocked
    }

    fn set_writable(&mut self) {
        self.0.borrow_mut().blocked = false;
    }
}

/// Everything the connection reported
#[derive(Debug, Default)]
pub(crate) struct VisitorState {
    pub(crate) closed: Vec<ConnectionError>,
    pub(crate) crypto: Vec<(EncryptionLevel, Crypto)>,
    pub(crate) streams: Vec<Stream>,
    pub(crate) messages: Vec<Bytes>,
    pub(crate) migrations: Vec<AddressChange>,
    pub(crate) path_degrading: u32,
    pub(crate) forward_progress: u32,
    pub(crate) handshake_done: u32,
    pub(crate) key_updates: Vec<KeyUpdateReason>,
    pub(crate) write_blocked: u32,
    pub(crate) can_write: u32,
    /// Answer to `willing_and_able_to_write`
    pub(crate) willing: bool,
}

pub(crate) struct TestVisitor(pub(crate) Rc<RefCell<VisitorState>>);

impl Visitor for TestVisitor {
    fn on_connection_closed(&mut self, error: &ConnectionError) {
        self.0.borrow_mut().closed.push(error.clone());
    }

    fn on_write_blocked(&mut self) {
        self.0.borrow_mut().write_blocked += 1;
    }

    fn on_can_write(&mut self) {
        self.0.borrow_mut().can_write += 1;
    }

    fn on_stream_frame(&mut self, frame: &Stream) {
        self.0.borrow_mut().streams.push(frame.clone());
    }

    fn on_crypto_frame(&mut self, level: EncryptionLevel, frame: &Crypto) {
        self.0.borrow_mut().crypto.push((level, frame.clone()));
    }

    fn on_message_received(&mut self, data: &Bytes) {
        self.0.borrow_mut().messages.push(data.clone());
    }

    fn on_connection_migration(&mut self, change: AddressChange) {
        self.0.borrow_mut().migrations.push(change);
    }

    fn on_path_degrading(&mut self) {
        self.0.borrow_mut().path_degrading += 1;
    }

    fn on_forward_progress_made_after_path_degrading(&mut self) {
        self.0.borrow_mut().forward_progress += 1;
    }

    fn on_handshake_done_received(&mut self) {
        self.0.borrow_mut().handshake_done += 1;
    }

    fn on_key_update(&mut self, reason: KeyUpdateReason) {
        self.0.borrow_mut().key_updates.push(reason);
    }

    fn willing_and_able_to_write(&self) -> bool {
        self.0.borrow().willing
    }
}

pub(crate) type Outcomes = Rc<RefCell<Vec<(SocketAddr, SocketAddr, PathValidationOutcome)>>>;

pub(crate) struct TestDelegate(pub(crate) Outcomes);

impl PathValidationDelegate for TestDelegate {
    fn on_path_validation_outcome(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        outcome: PathValidationOutcome,
    ) {
        self.0.borrow_mut().push((local, remote, outcome));
    }
}

/// The remote endpoint, reduced to numbering and addressing the packets it sends
#[derive(Debug)]
pub(crate) struct Peer {
    /// The ID the peer is addressed with
    pub(crate) cid: ConnectionId,
    /// The ID the peer addresses the connection under test with
    pub(crate) dst_cid: ConnectionId,
    next_number: [u64; 3],
    pub(crate) key_phase: bool,
}

impl Peer {
    fn new() -> Self {
        Self {
            cid: ConnectionId::new(&PEER_CID),
            dst_cid: ConnectionId::new(&LOCAL_CID),
            next_number: [0; 3],
            key_phase: false,
        }
    }

    /// Build one datagram of coalesced packets, the last padded to make it `min_len` bytes long
    pub(crate) fn datagram(
        &mut self,
        codec: &TestCodec,
        packets: Vec<(EncryptionLevel, Vec<Frame>)>,
        min_len: usize,
    ) -> Bytes {
        let mut buf = Vec::new();
        let count = packets.len();
        for (i, (level, frames)) in packets.into_iter().enumerate() {
            let space = level.space();
            let number = self.next_number[space];
            self.next_number[space] += 1;
            let header = PacketHeader {
                level,
                dst_cid: self.dst_cid,
                src_cid: level.has_long_header().then_some(self.cid),
                number,
                key_phase: level == EncryptionLevel::ForwardSecure && self.key_phase,
            };
            let min_size = match i + 1 == count {
                true => min_len.saturating_sub(buf.len()),
                false => 0,
            };
            codec.build(header, frames, min_size, &mut buf);
        }
        buf.into()
    }

    pub(crate) fn next_number(&self, space: SpaceId) -> u64 {
        self.next_number[space]
    }
}

pub(crate) fn test_config() -> ConnectionConfig {
    let mut config = ConnectionConfig::default();
    config.pacing(false);
    config
}

/// A connection wired to recording stand-ins for its codec, writer, visitor and clock
pub(crate) struct Harness {
    pub(crate) conn: Connection,
    pub(crate) codec: TestCodec,
    pub(crate) clock: ManualClock,
    pub(crate) writer: Rc<RefCell<WriterState>>,
    pub(crate) visitor: Rc<RefCell<VisitorState>>,
    pub(crate) peer: Peer,
    pub(crate) local: SocketAddr,
    pub(crate) remote: SocketAddr,
    _guard: DefaultGuard,
}

impl Harness {
    /// A connection that has not exchanged anything yet; only Initial keys are installed
    pub(crate) fn new(side: Side, config: ConnectionConfig) -> Self {
        let guard = subscribe();
        let (local, remote) = match side {
            Side::Client => (addr(CLIENT_ADDR), addr(SERVER_ADDR)),
            Side::Server => (addr(SERVER_ADDR), addr(CLIENT_ADDR)),
        };
        let codec = TestCodec::default();
        codec.install_keys(EncryptionLevel::Initial);
        let clock = ManualClock::new();
        let writer = Rc::new(RefCell::new(WriterState::default()));
        let visitor = Rc::new(RefCell::new(VisitorState::default()));
        let conn = Connection::new(
            Arc::new(config),
            side,
            ConnectionId::new(&LOCAL_CID),
            ConnectionId::new(&PEER_CID),
            local,
            remote,
            Box::new(codec.clone()),
            Box::new(TestWriter(writer.clone())),
            Box::new(TestVisitor(visitor.clone())),
            Box::new(clock.clone()),
            [7; 32],
        );
        Self {
            conn,
            codec,
            clock,
            writer,
            visitor,
            peer: Peer::new(),
            local,
            remote,
            _guard: guard,
        }
    }

    /// A connection whose handshake is confirmed, with nothing left to send
    pub(crate) fn established(side: Side) -> Self {
        Self::established_with(side, test_config())
    }

    pub(crate) fn established_with(side: Side, config: ConnectionConfig) -> Self {
        let mut h = Self::new(side, config);
        for level in [EncryptionLevel::Handshake, EncryptionLevel::ForwardSecure] {
            h.codec.install_keys(level);
            h.conn.on_encryption_keys_available(level);
            h.conn.on_decryption_keys_available(level);
        }
        // A Handshake packet proves the client owns its address
        h.receive(vec![(EncryptionLevel::Handshake, vec![Frame::Ping])], 0);
        h.conn.set_default_encryption_level(EncryptionLevel::ForwardSecure);
        h.conn.set_handshake_state(HandshakeState::Complete);
        if side.is_client() {
            h.receive(vec![(EncryptionLevel::ForwardSecure, vec![Frame::HandshakeDone])], 0);
        }
        assert_eq!(h.conn.handshake_state(), HandshakeState::Confirmed);
        assert!(h.conn.is_peer_address_validated());
        h.take_sent();
        h
    }

    pub(crate) fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Deliver a datagram from the peer's default address
    pub(crate) fn receive(&mut self, packets: Vec<(EncryptionLevel, Vec<Frame>)>, min_len: usize) {
        let remote = self.remote;
        self.receive_from(remote, packets, min_len);
    }

    pub(crate) fn receive_from(
        &mut self,
        remote: SocketAddr,
        packets: Vec<(EncryptionLevel, Vec<Frame>)>,
        min_len: usize,
    ) {
        let data = self.peer.datagram(&self.codec, packets, min_len);
        self.deliver(remote, data);
    }

    pub(crate) fn deliver(&mut self, remote: SocketAddr, data: Bytes) {
        let local = self.local;
        self.conn.process_udp_packet(local, remote, data);
    }

    /// Acknowledge every 1-RTT packet sent so far
    pub(crate) fn ack_all(&mut self) {
        let Some(largest) = self.conn.largest_sent(SpaceId::Data) else {
            return;
        };
        let mut ranges = RangeSet::new();
        ranges.insert(0..largest + 1);
        self.ack(ranges);
    }

    pub(crate) fn ack(&mut self, ranges: RangeSet) {
        let ack = Ack::new(ranges, Duration::ZERO).unwrap();
        self.receive(vec![(EncryptionLevel::ForwardSecure, vec![Frame::Ack(ack)])], 0);
    }

    pub(crate) fn take_sent(&self) -> Vec<Datagram> {
        std::mem::take(&mut self.writer.borrow_mut().sent)
    }

    pub(crate) fn parse(&self, datagram: &Datagram) -> Vec<(PacketHeader, Vec<Frame>)> {
        self.codec.parse(&datagram.data)
    }

    /// Move the clock to the next deadline and handle it
    pub(crate) fn fire_next_timeout(&mut self) -> Option<Instant> {
        let deadline = self.conn.poll_timeout()?;
        if deadline > self.now() {
            self.clock.set(deadline);
        }
        self.conn.handle_timeout(deadline);
        Some(deadline)
    }

    pub(crate) fn closed(&self) -> Vec<ConnectionError> {
        self.visitor.borrow().closed.clone()
    }
}
