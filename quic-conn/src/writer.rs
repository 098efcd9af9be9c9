use std::net::SocketAddr;

/// Outcome of handing a datagram to a [`PacketWriter`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WriteResult {
    /// The datagram was accepted; carries the number of bytes written
    Ok(usize),
    /// The socket is blocked; the datagram was not written and must be retried
    Blocked,
    /// The socket is blocked, but the writer kept a copy of the datagram and will send it later
    BlockedDataBuffered,
    /// The datagram exceeded what the path or socket can carry
    MsgTooBig,
    /// Any other I/O failure, with the OS error code
    Error(i32),
}

impl WriteResult {
    /// Whether the socket reported itself blocked
    pub fn is_blocked(self) -> bool {
        matches!(self, Self::Blocked | Self::BlockedDataBuffered)
    }

    /// Whether the write failed
    pub fn is_error(self) -> bool {
        matches!(self, Self::MsgTooBig | Self::Error(_))
    }
}

/// Hands finished datagrams to the network
///
/// A single writer may be shared by several connections, so it tracks its own blocked state.
pub trait PacketWriter {
    /// Send `buf` from `self_addr` to `peer_addr`
    fn write(&mut self, buf: &[u8], self_addr: SocketAddr, peer_addr: SocketAddr) -> WriteResult;

    /// Whether the socket is currently blocked
    fn is_write_blocked(&self) -> bool;

    /// Record that the socket has become writable again
    fn set_writable(&mut self);

    /// Send any datagrams the writer batched up
    fn flush(&mut self) -> WriteResult {
        WriteResult::Ok(0)
    }

    /// Whether writes are batched until [`flush`](Self::flush)
    fn is_batch_mode(&self) -> bool {
        false
    }
}
