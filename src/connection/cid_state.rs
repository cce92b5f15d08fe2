//! Maintain the state of local connection IDs
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use rustc_hash::FxHashSet;
use tracing::{debug, trace};

use crate::{shared::IssuedCid, TransportError};

/// Data structure that records when issued cids should be retired
#[derive(Copy, Clone, Eq, PartialEq)]
pub(crate) struct CidTimestamp {
    /// Highest cid sequence number created in a batch
    sequence: u64,
    /// Timestamp when cid needs to be retired
    timestamp: Instant,
}

/// Local connection ID management
///
/// `CidState` maintains attributes of local connection IDs
pub(crate) struct CidState {
    /// Timestamp when issued cids should be retired
    retire_timestamp: VecDeque<CidTimestamp>,
    /// Number of local connection IDs that have been issued in NEW_CONNECTION_ID frames
    issued: u64,
    /// Sequence numbers of local connection IDs not yet retired by the peer
    active_seq: FxHashSet<u64>,
    /// Sequence number the peer has already retired all CIDs below at our request via `retire_prior_to`
    prev_retire_seq: u64,
    /// Sequence number to set in retire_prior_to field in NEW_CONNECTION_ID frame
    retire_seq: u64,
    /// cid length used to decode short packet
    cid_len: usize,
    /// cid lifetime
    cid_lifetime: Option<Duration>,
}

impl CidState {
    pub(crate) fn new(
        cid_len: usize,
        cid_lifetime: Option<Duration>,
        now: Instant,
        issued: u64,
    ) -> Self {
        let mut active_seq = FxHashSet::default();
        // Add sequence numbers of CIDs used in handshaking into the tracking set
        for seq in 0..issued {
            active_seq.insert(seq);
        }
        let mut this = Self {
            retire_timestamp: VecDeque::new(),
            issued,
            active_seq,
            prev_retire_seq: 0,
            retire_seq: 0,
            cid_len,
            cid_lifetime,
        };
        // Track lifetime of CIDs used in handshaking
        if issued > 0 {
            this.track_lifetime(issued - 1, now);
        }
        this
    }

    /// Find the next timestamp when previously issued CID should be retired
    pub(crate) fn next_timeout(&mut self) -> Option<Instant> {
        self.retire_timestamp.front().map(|nc| {
            trace!("CID {} will expire at {:?}", nc.sequence, nc.timestamp);
            nc.timestamp
        })
    }

    /// Track the lifetime of issued cids in `retire_timestamp`
    fn track_lifetime(&mut self, new_cid_seq: u64, now: Instant) {
        let Some(lifetime) = self.cid_lifetime else {
            return;
        };
        let Some(expire_at) = now.checked_add(lifetime) else {
            return;
        };
        if let Some(last) = self.retire_timestamp.back_mut() {
            // Combine into a single batch if timestamp of current cid is same as the last record
            if expire_at == last.timestamp {
                debug_assert!(new_cid_seq > last.sequence);
                last.sequence = new_cid_seq;
                return;
            }
        }
        self.retire_timestamp.push_back(CidTimestamp {
            sequence: new_cid_seq,
            timestamp: expire_at,
        });
    }

    /// Update local CID state when previously issued CIDs time out
    ///
    /// Returns whether a NEW_CONNECTION_ID frame with an updated
    /// `retire_prior_to` needs to go out.
    pub(crate) fn on_cid_timeout(&mut self) -> bool {
        // Whether the peer hasn't retired all the CIDs we asked it to yet
        let unretired_ids_found =
            (self.prev_retire_seq..self.retire_seq).any(|seq| self.active_seq.contains(&seq));
        // "Endpoints SHOULD NOT issue updates of the Retire Prior To field before receiving
        // RETIRE_CONNECTION_ID frames that retire all connection IDs indicated by the previous
        // Retire Prior To value."
        // https://www.rfc-editor.org/rfc/rfc9000.html#section-5.1.2
        if !unretired_ids_found {
            self.prev_retire_seq = self.retire_seq;
        }

        let next_retire_sequence = self
            .retire_timestamp
            .pop_front()
            .map(|seq| seq.sequence + 1);
        let current_retire_prior_to = self.retire_seq;

        // Advance `retire_seq` if the next cid that needs to be retired exists
        if let Some(next_retire_prior_to) = next_retire_sequence {
            if !unretired_ids_found && next_retire_prior_to > current_retire_prior_to {
                self.retire_seq = next_retire_prior_to;
            }
        }

        (current_retire_prior_to..self.retire_seq).any(|seq| self.active_seq.contains(&seq))
    }

    /// Register a fresh batch of identifiers issued by the driving endpoint
    pub(crate) fn new_cids(&mut self, ids: &[IssuedCid], now: Instant) {
        debug_assert!(!ids.is_empty());
        let mut max_seq = 0;
        for cid in ids {
            self.active_seq.insert(cid.sequence);
            max_seq = max_seq.max(cid.sequence);
        }
        self.issued = self.issued.max(max_seq + 1);
        self.track_lifetime(max_seq, now);
    }

    /// Handle a RETIRE_CONNECTION_ID frame from the peer
    ///
    /// Returns whether the pool of issued CIDs should be replenished.
    pub(crate) fn on_cid_retirement(
        &mut self,
        sequence: u64,
        limit: u64,
    ) -> Result<bool, TransportError> {
        if sequence >= self.issued {
            debug!("peer retired unissued CID sequence {sequence}");
            return Err(TransportError::PROTOCOL_VIOLATION(
                "RETIRE_CONNECTION_ID for unissued sequence number",
            ));
        }
        self.active_seq.remove(&sequence);
        Ok((self.active_seq.len() as u64) < limit)
    }

    /// Number of CIDs the peer may still route by
    pub(crate) fn active_cids(&self) -> u64 {
        self.active_seq.len() as u64
    }

    pub(crate) fn retire_prior_to(&self) -> u64 {
        self.retire_seq
    }

    pub(crate) fn cid_len(&self) -> usize {
        self.cid_len
    }
}
