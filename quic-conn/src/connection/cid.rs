//! Connection ID management for both directions

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::{frame::NewConnectionId, shared::ConnectionId};

use super::QuicErrorCode;

/// Why a NEW_CONNECTION_ID or RETIRE_CONNECTION_ID frame was rejected
#[derive(Debug, Clone, Eq, PartialEq)]
pub(super) struct CidError {
    pub(super) code: QuicErrorCode,
    pub(super) reason: &'static str,
}

impl CidError {
    fn new(code: QuicErrorCode, reason: &'static str) -> Self {
        Self { code, reason }
    }
}

/// Connection IDs this endpoint is reached through, and those the peer issued to it
#[derive(Debug)]
pub(super) struct CidState {
    /// The ID packets from the peer are expected to carry
    local: ConnectionId,
    /// Further IDs accepted, such as a client-chosen ID the server replaced
    incoming: FxHashSet<ConnectionId>,
    /// IDs issued to the peer in NEW_CONNECTION_ID frames, by sequence number
    issued: FxHashMap<u64, ConnectionId>,
    next_issued_sequence: u64,
    /// The peer-issued ID in use, with its sequence number
    remote: (u64, ConnectionId),
    /// Peer-issued IDs in reserve, in sequence order
    unused_remote: VecDeque<(u64, ConnectionId)>,
    retire_prior_to: u64,
    /// Peer-issued IDs we may hold at once, including the one in use
    limit: usize,
    /// Sequence numbers to report in RETIRE_CONNECTION_ID frames
    pending_retirements: Vec<u64>,
}

impl CidState {
    pub(super) fn new(local: ConnectionId, remote: ConnectionId, limit: usize) -> Self {
        Self {
            local,
            incoming: FxHashSet::default(),
            issued: FxHashMap::default(),
            next_issued_sequence: 1,
            remote: (0, remote),
            unused_remote: VecDeque::new(),
            retire_prior_to: 0,
            limit,
            pending_retirements: Vec::new(),
        }
    }

    pub(super) fn local(&self) -> ConnectionId {
        self.local
    }

    pub(super) fn remote(&self) -> ConnectionId {
        self.remote.1
    }

    /// Whether a packet addressed to `cid` belongs to this connection
    pub(super) fn is_local(&self, cid: &ConnectionId) -> bool {
        *cid == self.local || self.incoming.contains(cid)
    }

    /// Also accept packets addressed to `cid`
    pub(super) fn add_incoming(&mut self, cid: ConnectionId) {
        if cid != self.local && self.incoming.insert(cid) {
            trace!(%cid, "accepting additional connection ID");
        }
    }

    /// The server learned the ID it is reached through from the client's first packet
    pub(super) fn set_remote(&mut self, cid: ConnectionId) {
        self.remote.1 = cid;
    }

    /// Register a new ID issued to the peer, returning its sequence number
    pub(super) fn issue(&mut self, cid: ConnectionId) -> u64 {
        let sequence = self.next_issued_sequence;
        self.next_issued_sequence += 1;
        self.issued.insert(sequence, cid);
        self.add_incoming(cid);
        sequence
    }

    pub(super) fn on_new_connection_id(&mut self, frame: &NewConnectionId) -> Result<(), CidError> {
        if frame.retire_prior_to > frame.sequence {
            return Err(CidError::new(
                QuicErrorCode::ProtocolViolation,
                "retire_prior_to exceeds sequence number",
            ));
        }
        let known = (frame.sequence == self.remote.0).then_some(self.remote.1).or_else(|| {
            self.unused_remote
                .iter()
                .find(|&&(seq, _)| seq == frame.sequence)
                .map(|&(_, cid)| cid)
        });
        if let Some(cid) = known {
            if cid != frame.id {
                return Err(CidError::new(
                    QuicErrorCode::ProtocolViolation,
                    "connection ID sequence number reused",
                ));
            }
            return Ok(());
        }

        if frame.retire_prior_to > self.retire_prior_to {
            self.retire_prior_to = frame.retire_prior_to;
            let retire_prior_to = self.retire_prior_to;
            let retired = &mut self.pending_retirements;
            self.unused_remote.retain(|&(seq, _)| {
                let keep = seq >= retire_prior_to;
                if !keep {
                    retired.push(seq);
                }
                keep
            });
        }

        if frame.sequence < self.retire_prior_to {
            // Retired as soon as it arrived
            self.pending_retirements.push(frame.sequence);
        } else {
            let idx = self
                .unused_remote
                .partition_point(|&(seq, _)| seq < frame.sequence);
            self.unused_remote.insert(idx, (frame.sequence, frame.id));
        }

        if self.remote.0 < self.retire_prior_to {
            if let Some(next) = self.unused_remote.pop_front() {
                self.pending_retirements.push(self.remote.0);
                debug!(sequence = next.0, "switching to new peer connection ID");
                self.remote = next;
            }
        }

        if self.unused_remote.len() + 1 > self.limit {
            return Err(CidError::new(
                QuicErrorCode::ConnectionIdLimitError,
                "too many connection IDs issued",
            ));
        }
        Ok(())
    }

    /// Switch to a fresh peer-issued ID, retiring the one in use
    pub(super) fn next_remote(&mut self) -> Option<ConnectionId> {
        let next = self.unused_remote.pop_front()?;
        self.pending_retirements.push(self.remote.0);
        self.remote = next;
        Some(next.1)
    }

    pub(super) fn on_retire_connection_id(
        &mut self,
        sequence: u64,
        packet_cid: &ConnectionId,
    ) -> Result<(), CidError> {
        if sequence >= self.next_issued_sequence {
            return Err(CidError::new(
                QuicErrorCode::ProtocolViolation,
                "RETIRE_CONNECTION_ID for an ID never issued",
            ));
        }
        let Some(&cid) = self.issued.get(&sequence) else {
            return Ok(());
        };
        if cid == *packet_cid {
            return Err(CidError::new(
                QuicErrorCode::ProtocolViolation,
                "RETIRE_CONNECTION_ID refers to the ID of the packet carrying it",
            ));
        }
        self.issued.remove(&sequence);
        self.incoming.remove(&cid);
        trace!(sequence, %cid, "connection ID retired by peer");
        Ok(())
    }

    pub(super) fn take_retirements(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.pending_retirements)
    }
}
