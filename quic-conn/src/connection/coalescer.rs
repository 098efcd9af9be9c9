use std::{cmp, net::SocketAddr};

use tracing::trace;

use crate::{
    EncryptionLevel, MIN_INITIAL_SIZE,
    packet::{EncodeError, PacketCodec},
};

use super::packet_creator::PendingPacket;

/// Packets of different encryption levels waiting to share one datagram
///
/// Holds at most one packet per level, all to the same pair of addresses. Packets stay
/// unencoded until [`encode`](Self::encode), when the datagram's final layout is known.
#[derive(Debug, Default)]
pub(super) struct CoalescedPackets {
    addresses: Option<(SocketAddr, SocketAddr)>,
    packets: Vec<PendingPacket>,
    /// Expected encoded length of everything held
    length: usize,
    max_length: usize,
}

impl CoalescedPackets {
    /// Try to add `packet`, handing it back if it must go into another datagram
    pub(super) fn maybe_coalesce(
        &mut self,
        packet: PendingPacket,
        local: SocketAddr,
        remote: SocketAddr,
        max_length: usize,
    ) -> Result<(), PendingPacket> {
        let len = packet.encoded_length();
        match self.addresses {
            None => {
                self.addresses = Some((local, remote));
                self.max_length = max_length;
            }
            Some(addresses) if addresses != (local, remote) => return Err(packet),
            Some(_) => {}
        }
        let level = packet.level();
        let conflicts = self.packets.iter().any(|p| {
            p.level() == level
                // 0-RTT must precede 1-RTT in both the datagram and packet number order
                || (level == EncryptionLevel::ZeroRtt
                    && p.level() == EncryptionLevel::ForwardSecure)
        });
        if conflicts || self.length + len > self.max_length {
            if self.packets.is_empty() {
                self.addresses = None;
            }
            return Err(packet);
        }
        trace!(%level, number = packet.number(), len, "coalescing packet");
        self.length += len;
        let idx = self.packets.partition_point(|p| p.level() < level);
        self.packets.insert(idx, packet);
        Ok(())
    }

    pub(super) fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Bytes left for a further packet, or `None` if nothing is held
    pub(super) fn remaining_space(&self) -> Option<usize> {
        match self.packets.is_empty() {
            true => None,
            false => Some(self.max_length.saturating_sub(self.length)),
        }
    }

    /// Expected encoded length of everything held
    pub(super) fn length(&self) -> usize {
        self.length
    }

    /// Drop the packet at `level`, whose keys are gone
    pub(super) fn discard_level(&mut self, level: EncryptionLevel) {
        let Some(idx) = self.packets.iter().position(|p| p.level() == level) else {
            return;
        };
        let packet = self.packets.remove(idx);
        trace!(%level, number = packet.number(), "dropping coalesced packet");
        self.length -= packet.encoded_length();
        if self.packets.is_empty() {
            self.addresses = None;
        }
    }

    /// Take everything held, in the order the packets appear in the datagram
    pub(super) fn take(&mut self) -> Option<(SocketAddr, SocketAddr, Vec<PendingPacket>)> {
        let (local, remote) = self.addresses.take()?;
        self.length = 0;
        let packets = std::mem::take(&mut self.packets);
        Some((local, remote, packets))
    }

    pub(super) fn clear(&mut self) {
        self.addresses = None;
        self.packets.clear();
        self.length = 0;
    }

    /// Encode `packets` back to back into `buf`
    ///
    /// With `pad_initial`, a datagram carrying an Initial packet is padded to the minimum
    /// Initial datagram size by extending its last packet. Returns the encoded size of each packet.
    pub(super) fn encode(
        codec: &mut dyn PacketCodec,
        packets: &mut [PendingPacket],
        pad_initial: bool,
        buf: &mut Vec<u8>,
    ) -> Result<Vec<usize>, EncodeError> {
        let pad = pad_initial && packets.iter().any(|p| p.level() == EncryptionLevel::Initial);
        let start = buf.len();
        let mut sizes = Vec::with_capacity(packets.len());
        let count = packets.len();
        for (i, packet) in packets.iter_mut().enumerate() {
            if pad && i + 1 == count {
                let written = buf.len() - start;
                let needed = usize::from(MIN_INITIAL_SIZE).saturating_sub(written);
                packet.min_size = cmp::max(packet.min_size, needed);
            }
            let size = codec.encode(&packet.header, &packet.frames, packet.min_size, buf)?;
            sizes.push(size);
        }
        Ok(sizes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::packet_creator::PacketCreator, frame::Frame, shared::ConnectionId,
        tests::util::TestCodec,
    };

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 0, 2, 1], port))
    }

    fn packet(
        creator: &mut PacketCreator,
        codec: &TestCodec,
        level: EncryptionLevel,
    ) -> PendingPacket {
        creator.serialize_standalone(codec, level, vec![Frame::Ping], None, false)
    }

    fn setup() -> (PacketCreator, TestCodec) {
        let codec = TestCodec::default();
        for level in EncryptionLevel::ALL {
            codec.install_keys(level);
        }
        (
            PacketCreator::new(1200, ConnectionId::new(&[1; 4]), ConnectionId::new(&[2; 4])),
            codec,
        )
    }

    #[test]
    fn one_packet_per_level() {
        let (mut creator, codec) = setup();
        let mut coalesced = CoalescedPackets::default();
        assert_eq!(coalesced.remaining_space(), None);
        let handshake = packet(&mut creator, &codec, EncryptionLevel::Handshake);
        let initial = packet(&mut creator, &codec, EncryptionLevel::Initial);
        coalesced.maybe_coalesce(handshake, addr(1), addr(2), 1200).unwrap();
        coalesced.maybe_coalesce(initial, addr(1), addr(2), 1200).unwrap();
        let again = packet(&mut creator, &codec, EncryptionLevel::Initial);
        assert!(coalesced.maybe_coalesce(again, addr(1), addr(2), 1200).is_err());
        let elsewhere = packet(&mut creator, &codec, EncryptionLevel::ForwardSecure);
        assert!(coalesced.maybe_coalesce(elsewhere, addr(1), addr(3), 1200).is_err());

        let (_, remote, packets) = coalesced.take().unwrap();
        assert_eq!(remote, addr(2));
        let levels = packets.iter().map(|p| p.level()).collect::<Vec<_>>();
        assert_eq!(levels, vec![EncryptionLevel::Initial, EncryptionLevel::Handshake]);
        assert!(coalesced.is_empty());
        assert!(coalesced.take().is_none());
    }

    #[test]
    fn discarded_level_frees_space() {
        let (mut creator, codec) = setup();
        let mut coalesced = CoalescedPackets::default();
        let initial = packet(&mut creator, &codec, EncryptionLevel::Initial);
        coalesced.maybe_coalesce(initial, addr(1), addr(2), 1200).unwrap();
        let remaining = coalesced.remaining_space().unwrap();
        let handshake = packet(&mut creator, &codec, EncryptionLevel::Handshake);
        coalesced.maybe_coalesce(handshake, addr(1), addr(2), 1200).unwrap();
        assert!(coalesced.remaining_space().unwrap() < remaining);

        coalesced.discard_level(EncryptionLevel::Handshake);
        assert_eq!(coalesced.remaining_space(), Some(remaining));
        coalesced.discard_level(EncryptionLevel::Initial);
        assert!(coalesced.is_empty());
        assert!(coalesced.take().is_none());
        assert_eq!(coalesced.length(), 0);
    }

    #[test]
    fn zero_rtt_not_after_one_rtt() {
        let (mut creator, codec) = setup();
        let mut coalesced = CoalescedPackets::default();
        let one_rtt = packet(&mut creator, &codec, EncryptionLevel::ForwardSecure);
        coalesced.maybe_coalesce(one_rtt, addr(1), addr(2), 1200).unwrap();
        let zero_rtt = packet(&mut creator, &codec, EncryptionLevel::ZeroRtt);
        assert!(coalesced.maybe_coalesce(zero_rtt, addr(1), addr(2), 1200).is_err());
    }

    #[test]
    fn initial_datagram_is_padded() {
        let (mut creator, mut codec) = setup();
        let mut coalesced = CoalescedPackets::default();
        let initial = packet(&mut creator, &codec, EncryptionLevel::Initial);
        let handshake = packet(&mut creator, &codec, EncryptionLevel::Handshake);
        coalesced.maybe_coalesce(initial, addr(1), addr(2), 1200).unwrap();
        coalesced.maybe_coalesce(handshake, addr(1), addr(2), 1200).unwrap();
        assert!(coalesced.remaining_space().unwrap() > 1000);

        let (_, _, mut packets) = coalesced.take().unwrap();
        let mut buf = Vec::new();
        let sizes = CoalescedPackets::encode(&mut codec, &mut packets, true, &mut buf).unwrap();
        assert_eq!(buf.len(), 1200);
        assert_eq!(sizes.iter().sum::<usize>(), 1200);
        // Only the last packet grows
        assert_eq!(sizes[0], packets[0].length);

        let mut buf = Vec::new();
        let mut short = vec![packet(&mut creator, &codec, EncryptionLevel::Handshake)];
        CoalescedPackets::encode(&mut codec, &mut short, true, &mut buf).unwrap();
        assert!(buf.len() < 1200);
    }
}
