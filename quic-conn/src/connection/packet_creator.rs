use std::{cmp, collections::VecDeque};

use bytes::Bytes;
use tracing::trace;

use crate::{
    EncryptionLevel, Instant, SpaceId, StreamId,
    frame::{Crypto, Frame, Stream},
    packet::{PacketCodec, PacketHeader},
    shared::ConnectionId,
};

use super::recovery::{SentPacket, TransmissionType};

/// Smallest payload worth opening a packet under the soft length limit
const MIN_SOFT_PAYLOAD: usize = 32;

/// A finished packet, numbered and with its frames final, that has not been encoded yet
///
/// Encoding is deferred until the packet's place in a datagram is known, so that padding can be
/// decided without protecting a packet twice under the same packet number.
#[derive(Debug, Clone)]
pub(super) struct PendingPacket {
    pub(super) header: PacketHeader,
    pub(super) frames: Vec<Frame>,
    /// Encoded size the codec must pad to
    pub(super) min_size: usize,
    /// Expected encoded size before padding to `min_size`
    pub(super) length: usize,
    pub(super) transmission: TransmissionType,
    pub(super) ack_eliciting: bool,
    /// Largest packet number acknowledged by an ACK frame in this packet
    pub(super) largest_acked: Option<u64>,
    pub(super) is_mtu_probe: bool,
}

impl PendingPacket {
    pub(super) fn level(&self) -> EncryptionLevel {
        self.header.level
    }

    pub(super) fn space(&self) -> SpaceId {
        self.header.level.space()
    }

    pub(super) fn number(&self) -> u64 {
        self.header.number
    }

    /// Size the packet will occupy once encoded
    pub(super) fn encoded_length(&self) -> usize {
        cmp::max(self.length, self.min_size)
    }

    pub(super) fn has_retransmittable_frames(&self) -> bool {
        self.frames.iter().any(Frame::is_retransmittable)
    }

    /// The record kept by the sent-packet tracker once the packet is on its way
    pub(super) fn to_sent(&self, size: usize, now: Instant) -> SentPacket {
        let has_padding = self.frames.iter().any(|f| matches!(f, Frame::Padding(_)));
        SentPacket {
            level: self.header.level,
            transmission: self.transmission,
            time_sent: now,
            size: cmp::min(size, usize::from(u16::MAX)) as u16,
            in_flight: self.ack_eliciting || has_padding,
            ack_eliciting: self.ack_eliciting,
            retransmittable: self
                .frames
                .iter()
                .filter(|f| f.is_retransmittable())
                .cloned()
                .collect(),
            largest_acked: self.largest_acked,
            is_mtu_probe: self.is_mtu_probe,
        }
    }
}

#[derive(Debug)]
struct OpenPacket {
    level: EncryptionLevel,
    frames: Vec<Frame>,
    /// Header overhead plus the size of every frame added so far
    length: usize,
    limit: usize,
    ack_eliciting: bool,
    largest_acked: Option<u64>,
}

impl OpenPacket {
    fn room(&self) -> usize {
        self.limit.saturating_sub(self.length)
    }
}

/// Assembles frames into packets at one encryption level at a time
///
/// Finished packets are queued and taken by the connection, which decides their fate.
#[derive(Debug)]
pub(super) struct PacketCreator {
    next_number: [u64; 3],
    level: EncryptionLevel,
    open: Option<OpenPacket>,
    max_packet_length: u16,
    /// Limit applied to the next packet opened, leaving room in a coalesced datagram
    soft_max_length: Option<usize>,
    transmission: TransmissionType,
    dst_cid: ConnectionId,
    src_cid: ConnectionId,
    key_phase: bool,
    finished: VecDeque<PendingPacket>,
}

impl PacketCreator {
    pub(super) fn new(
        max_packet_length: u16,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
    ) -> Self {
        Self {
            next_number: [0; 3],
            level: EncryptionLevel::Initial,
            open: None,
            max_packet_length,
            soft_max_length: None,
            transmission: TransmissionType::NotRetransmission,
            dst_cid,
            src_cid,
            key_phase: false,
            finished: VecDeque::new(),
        }
    }

    pub(super) fn level(&self) -> EncryptionLevel {
        self.level
    }

    /// Switch levels for frames added from now on
    ///
    /// A packet under construction at another level is closed once a frame is added at the new
    /// one, so switching back and forth without adding anything keeps it open.
    pub(super) fn set_encryption_level(&mut self, level: EncryptionLevel) {
        if self.level != level {
            trace!(from = %self.level, to = %level, "creator level changed");
            self.level = level;
        }
    }

    pub(super) fn set_transmission_type(&mut self, transmission: TransmissionType) {
        self.transmission = transmission;
    }

    pub(super) fn max_packet_length(&self) -> u16 {
        self.max_packet_length
    }

    /// Takes effect from the next packet opened
    pub(super) fn set_max_packet_length(&mut self, length: u16) {
        self.max_packet_length = length;
    }

    pub(super) fn set_soft_max_length(&mut self, length: Option<usize>) {
        self.soft_max_length = length;
    }

    pub(super) fn set_destination_cid(&mut self, cid: ConnectionId) {
        self.dst_cid = cid;
    }

    pub(super) fn destination_cid(&self) -> ConnectionId {
        self.dst_cid
    }

    pub(super) fn set_key_phase(&mut self, key_phase: bool) {
        self.key_phase = key_phase;
    }

    pub(super) fn has_pending_frames(&self) -> bool {
        self.open.as_ref().is_some_and(|p| !p.frames.is_empty())
    }

    /// Bytes taken by the packet under construction, 0 if there is none
    pub(super) fn open_length(&self) -> usize {
        self.open.as_ref().map_or(0, |p| p.length)
    }

    pub(super) fn has_pending_retransmittable_frames(&self) -> bool {
        self.open
            .as_ref()
            .is_some_and(|p| p.frames.iter().any(Frame::is_retransmittable))
    }

    /// Whether the packet under construction at the current level already carries an ACK frame
    pub(super) fn has_ack(&self) -> bool {
        self.open
            .as_ref()
            .is_some_and(|p| p.level == self.level && p.largest_acked.is_some())
    }

    /// Leave a packet number unused, returning it
    pub(super) fn skip_packet_number(&mut self, codec: &dyn PacketCodec, space: SpaceId) -> u64 {
        if self.open.as_ref().is_some_and(|p| p.level.space() == space) {
            self.flush(codec);
        }
        let skipped = self.next_number[space];
        self.next_number[space] += 1;
        trace!(?space, skipped, "skipping packet number");
        skipped
    }

    /// Add `frame` to the packet under construction, starting a new packet if it does not fit
    ///
    /// Returns false if the frame is too large for any packet.
    pub(super) fn add_frame(&mut self, codec: &dyn PacketCodec, frame: Frame) -> bool {
        let size = codec.frame_size(&frame);
        if !self.ensure_room(codec, size) {
            trace!(ty = ?frame.ty(), size, "frame does not fit in a packet");
            return false;
        }
        let flush_now = matches!(frame, Frame::Ping);
        self.push(frame, size);
        if flush_now {
            self.flush(codec);
        }
        true
    }

    /// Add an ACK frame, placing it in the packet under construction if possible
    pub(super) fn add_ack(&mut self, codec: &dyn PacketCodec, frame: Frame, largest: u64) -> bool {
        if !self.add_frame(codec, frame) {
            return false;
        }
        if let Some(open) = &mut self.open {
            open.largest_acked = Some(largest);
        }
        true
    }

    /// Add as much of `data` as fits in one packet as a STREAM frame
    ///
    /// Returns the number of bytes taken and whether the FIN was included.
    pub(super) fn add_stream_frame(
        &mut self,
        codec: &dyn PacketCodec,
        id: StreamId,
        data: &Bytes,
        offset: u64,
        fin: bool,
    ) -> (usize, bool) {
        let empty = Frame::Stream(Stream {
            id,
            offset,
            fin,
            data: Bytes::new(),
        });
        let overhead = codec.frame_size(&empty);
        let Some(room) = self.room_for_data(codec, overhead, data.len()) else {
            return (0, false);
        };
        let len = cmp::min(room, data.len());
        let fin = fin && len == data.len();
        let frame = Frame::Stream(Stream {
            id,
            offset,
            fin,
            data: data.slice(..len),
        });
        let size = codec.frame_size(&frame);
        self.push(frame, size);
        (len, fin)
    }

    /// Add as much of `data` as fits in one packet as a CRYPTO frame
    pub(super) fn add_crypto_frame(
        &mut self,
        codec: &dyn PacketCodec,
        offset: u64,
        data: &Bytes,
    ) -> usize {
        let empty = Frame::Crypto(Crypto {
            offset,
            data: Bytes::new(),
        });
        let overhead = codec.frame_size(&empty);
        let Some(room) = self.room_for_data(codec, overhead, data.len()) else {
            return 0;
        };
        let len = cmp::min(room, data.len());
        let frame = Frame::Crypto(Crypto {
            offset,
            data: data.slice(..len),
        });
        let size = codec.frame_size(&frame);
        self.push(frame, size);
        len
    }

    /// Resend a frame from a lost packet, splitting stream and crypto data if needed
    pub(super) fn add_retransmission(&mut self, codec: &dyn PacketCodec, frame: Frame) -> bool {
        match frame {
            Frame::Stream(stream) => {
                let mut sent = 0;
                loop {
                    let rest = stream.data.slice(sent..);
                    let (len, fin) = self.add_stream_frame(
                        codec,
                        stream.id,
                        &rest,
                        stream.offset + sent as u64,
                        stream.fin,
                    );
                    sent += len;
                    if sent == stream.data.len() && (fin || !stream.fin) {
                        return true;
                    }
                    if len == 0 && !self.has_pending_frames() {
                        return false;
                    }
                }
            }
            Frame::Crypto(crypto) => {
                let mut sent = 0;
                while sent < crypto.data.len() {
                    let rest = crypto.data.slice(sent..);
                    let len = self.add_crypto_frame(codec, crypto.offset + sent as u64, &rest);
                    if len == 0 && !self.has_pending_frames() {
                        return false;
                    }
                    sent += len;
                }
                true
            }
            frame => self.add_frame(codec, frame),
        }
    }

    /// Close the packet under construction
    pub(super) fn flush(&mut self, codec: &dyn PacketCodec) {
        let Some(open) = self.open.take() else {
            return;
        };
        if open.frames.is_empty() {
            return;
        }
        let packet = self.finish(codec, open);
        self.finished.push_back(packet);
    }

    /// Drop the packet under construction and every finished packet not yet taken
    pub(super) fn clear(&mut self) {
        self.open = None;
        self.finished.clear();
    }

    /// Take the next finished packet, in the order they were closed
    pub(super) fn take_finished(&mut self) -> Option<PendingPacket> {
        self.finished.pop_front()
    }

    /// Build a complete packet from `frames` outside the normal accumulation
    ///
    /// Used for MTU probes, connectivity probes and CONNECTION_CLOSE. With `pad_to`, the packet is
    /// padded with a PADDING frame up to that length.
    pub(super) fn serialize_standalone(
        &mut self,
        codec: &dyn PacketCodec,
        level: EncryptionLevel,
        mut frames: Vec<Frame>,
        pad_to: Option<usize>,
        is_mtu_probe: bool,
    ) -> PendingPacket {
        let mut length = codec.packet_overhead(level, self.dst_cid.len())
            + frames.iter().map(|f| codec.frame_size(f)).sum::<usize>();
        if let Some(target) = pad_to {
            if target > length {
                frames.push(Frame::Padding(target - length));
                length = target;
            }
        }
        let open = OpenPacket {
            level,
            ack_eliciting: frames.iter().any(Frame::is_ack_eliciting),
            frames,
            length,
            limit: length,
            largest_acked: None,
        };
        let mut packet = self.finish(codec, open);
        packet.is_mtu_probe = is_mtu_probe;
        packet
    }

    fn finish(&mut self, codec: &dyn PacketCodec, open: OpenPacket) -> PendingPacket {
        let space = open.level.space();
        let number = self.next_number[space];
        self.next_number[space] += 1;
        let header = PacketHeader {
            level: open.level,
            dst_cid: self.dst_cid,
            src_cid: open.level.has_long_header().then_some(self.src_cid),
            number,
            key_phase: self.key_phase,
        };
        trace!(
            level = %open.level,
            number,
            frames = open.frames.len(),
            length = open.length,
            overhead = codec.packet_overhead(open.level, self.dst_cid.len()),
            "packet finished"
        );
        PendingPacket {
            header,
            frames: open.frames,
            min_size: 0,
            length: open.length,
            transmission: self.transmission,
            ack_eliciting: open.ack_eliciting,
            largest_acked: open.largest_acked,
            is_mtu_probe: false,
        }
    }

    fn push(&mut self, frame: Frame, size: usize) {
        let Some(open) = &mut self.open else {
            return;
        };
        open.ack_eliciting |= frame.is_ack_eliciting();
        open.length += size;
        open.frames.push(frame);
    }

    /// Make sure a packet is open with at least `size` bytes free
    fn ensure_room(&mut self, codec: &dyn PacketCodec, size: usize) -> bool {
        if self
            .open
            .as_ref()
            .is_some_and(|p| p.level == self.level && p.room() >= size)
        {
            return true;
        }
        self.flush(codec);
        self.open_packet(codec, false);
        if self.open.as_ref().is_some_and(|p| p.room() >= size) {
            return true;
        }
        // The soft limit only applies while it leaves room for the frame
        self.open_packet(codec, true);
        self.open.as_ref().is_some_and(|p| p.room() >= size)
    }

    /// Room for data after a frame header of `overhead` bytes, opening a new packet if the
    /// current one cannot take any
    fn room_for_data(
        &mut self,
        codec: &dyn PacketCodec,
        overhead: usize,
        len: usize,
    ) -> Option<usize> {
        let wanted = overhead + cmp::min(len, 1);
        if !self.ensure_room(codec, wanted) {
            return None;
        }
        self.open.as_ref().map(|p| p.room() - overhead)
    }

    fn open_packet(&mut self, codec: &dyn PacketCodec, ignore_soft_max: bool) {
        let overhead = codec.packet_overhead(self.level, self.dst_cid.len());
        let hard = usize::from(self.max_packet_length);
        let limit = match self.soft_max_length {
            Some(soft) if !ignore_soft_max && soft >= overhead + MIN_SOFT_PAYLOAD => {
                cmp::min(soft, hard)
            }
            _ => hard,
        };
        self.open = Some(OpenPacket {
            level: self.level,
            frames: Vec::new(),
            length: overhead,
            limit,
            ack_eliciting: false,
            largest_acked: None,
        });
    }
}
