use std::{cmp, ops::Range};

use crate::{frame::NewConnectionId, ConnectionId, ResetToken};

/// Connection IDs the peer has issued for addressing it, ordered by sequence number
///
/// Holds a fixed window of consecutive sequence numbers anchored at the active CID.
/// Slots may be vacant when NEW_CONNECTION_ID frames arrive out of order.
#[derive(Debug)]
pub(crate) struct CidQueue {
    /// `slots[i]` holds the CID with sequence number `base + i`, if it has arrived
    ///
    /// `slots[0]` is the active CID and is always occupied.
    slots: [Option<Slot>; Self::WINDOW],
    /// Sequence number of the active CID
    base: u64,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    id: ConnectionId,
    token: Option<ResetToken>,
}

impl CidQueue {
    /// How many consecutive sequence numbers fit in the window
    ///
    /// An `active_connection_id_limit` advertised above this invites the peer to
    /// overrun the window.
    pub(crate) const WINDOW: usize = 5;

    pub(crate) fn new(cid: ConnectionId) -> Self {
        let mut slots = [None; Self::WINDOW];
        slots[0] = Some(Slot {
            id: cid,
            token: None,
        });
        Self { slots, base: 0 }
    }

    /// Record the contents of a `NEW_CONNECTION_ID` frame
    ///
    /// When the frame's `retire_prior_to` forces the active CID out, returns the
    /// non-empty range of retired sequence numbers and the reset token of the
    /// replacement that became active.
    pub(crate) fn insert(
        &mut self,
        cid: NewConnectionId,
    ) -> Result<Option<(Range<u64>, ResetToken)>, InsertError> {
        let rel = match cid.sequence.checked_sub(self.base) {
            Some(rel) => rel,
            None => return Err(InsertError::Retired),
        };
        let advance = cid.retire_prior_to.saturating_sub(self.base);
        if rel >= advance + Self::WINDOW as u64 {
            return Err(InsertError::ExceedsLimit);
        }

        if advance == 0 {
            self.slots[rel as usize] = Some(Slot {
                id: cid.id,
                token: Some(cid.reset_token),
            });
            return Ok(None);
        }

        // The active CID is among those retired; slide the window up to
        // `retire_prior_to` before recording the new CID
        self.slide(advance.min(Self::WINDOW as u64) as usize);
        let new_base = cmp::max(self.base, cid.retire_prior_to);
        self.slots[(cid.sequence - new_base) as usize] = Some(Slot {
            id: cid.id,
            token: Some(cid.reset_token),
        });

        // Sequence numbers between `retire_prior_to` and the first CID we hold may
        // still be in flight; they get retired if they ever arrive. Not retiring
        // them now bounds how many RETIRE_CONNECTION_ID frames one frame can cost.
        let lead = self
            .slots
            .iter()
            .position(Option::is_some)
            .expect("a retirement always supplies a replacement");
        self.slide(lead);
        let retired = self.base..cmp::min(new_base + lead as u64, self.base + Self::WINDOW as u64);
        self.base = new_base + lead as u64;
        let token = self.slots[0]
            .and_then(|slot| slot.token)
            .expect("CIDs beyond the initial always carry a reset token");
        Ok(Some((retired, token)))
    }

    /// Make the next known CID active, retiring the one it replaces
    ///
    /// Returns the new active CID's reset token and the non-empty range of sequence
    /// numbers left behind, or `None` when no spare CID is available.
    pub(crate) fn next(&mut self) -> Option<(ResetToken, Range<u64>)> {
        let step = self.slots[1..].iter().position(Option::is_some)? + 1;
        self.slide(step);
        let retired = self.base..self.base + step as u64;
        self.base += step as u64;
        let token = self.slots[0]
            .and_then(|slot| slot.token)
            .expect("CIDs beyond the initial always carry a reset token");
        Some((token, retired))
    }

    /// Discard the first `n` slots, shifting the rest down
    fn slide(&mut self, n: usize) {
        self.slots.rotate_left(n);
        for slot in &mut self.slots[Self::WINDOW - n..] {
            *slot = None;
        }
    }

    /// Replace the placeholder initial CID with the peer's actual choice
    pub(crate) fn update_initial_cid(&mut self, cid: ConnectionId) {
        debug_assert_eq!(self.base, 0);
        self.slots[0] = Some(Slot {
            id: cid,
            token: None,
        });
    }

    /// The CID outgoing packets are currently addressed with
    pub(crate) fn active(&self) -> ConnectionId {
        self.slots[0].expect("the active slot is always occupied").id
    }

    /// Sequence number of the active CID
    pub(crate) fn active_seq(&self) -> u64 {
        self.base
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum InsertError {
    /// The sequence number was retired earlier
    Retired,
    /// The sequence number lies beyond the window we advertised room for
    ExceedsLimit,
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: u64 = CidQueue::WINDOW as u64;

    fn frame(sequence: u64, retire_prior_to: u64) -> NewConnectionId {
        NewConnectionId {
            sequence,
            id: ConnectionId::new(&[0xAB; 8]),
            reset_token: ResetToken::from([0xCD; crate::RESET_TOKEN_SIZE]),
            retire_prior_to,
        }
    }

    fn queue() -> CidQueue {
        CidQueue::new(ConnectionId::new(&[0xFF; 8]))
    }

    #[test]
    fn starts_on_the_initial_cid() {
        let mut q = queue();
        assert_eq!(q.active(), ConnectionId::new(&[0xFF; 8]));
        assert_eq!(q.active_seq(), 0);
        assert!(q.next().is_none(), "no spare CID yet");
    }

    #[test]
    fn switches_through_contiguous_cids() {
        let mut q = queue();
        for seq in 1..WINDOW {
            q.insert(frame(seq, 0)).unwrap();
        }
        for seq in 1..WINDOW {
            let (_, retired) = q.next().unwrap();
            assert_eq!(q.active_seq(), seq);
            assert_eq!(retired, seq - 1..seq);
        }
        assert!(q.next().is_none());
    }

    #[test]
    fn switching_skips_gaps() {
        let mut q = queue();
        q.insert(frame(2, 0)).unwrap();
        q.insert(frame(4, 0)).unwrap();

        let (_, retired) = q.next().unwrap();
        assert_eq!(q.active_seq(), 2);
        assert_eq!(retired, 0..2, "the missing seq 1 is retired along with 0");

        let (_, retired) = q.next().unwrap();
        assert_eq!(q.active_seq(), 4);
        assert_eq!(retired, 2..4);
    }

    #[test]
    fn window_slides_indefinitely() {
        let mut q = queue();
        for seq in 1..4 * WINDOW {
            q.insert(frame(seq, 0)).unwrap_or_else(|_| {
                let (_, retired) = q.next().unwrap();
                assert_eq!(retired.end, q.active_seq());
                q.insert(frame(seq, 0)).unwrap()
            });
        }
        while q.next().is_some() {}
        assert_eq!(q.active_seq(), 4 * WINDOW - 1);
    }

    #[test]
    fn peer_retires_active_cid() {
        let mut q = queue();
        for seq in 1..WINDOW {
            q.insert(frame(seq, 0)).unwrap();
        }

        let (retired, _) = q.insert(frame(4, 2)).unwrap().unwrap();
        assert_eq!(retired, 0..2);
        assert_eq!(q.active_seq(), 2);
        // Replays of the same frame are inert
        assert_eq!(q.insert(frame(4, 2)), Ok(None));
    }

    #[test]
    fn retirement_covers_unseen_sequences() {
        let mut q = queue();
        q.insert(frame(2, 0)).unwrap();
        // Seq 1 never arrived; moving to 2 retires it anyway
        let (retired, _) = q.insert(frame(3, 1)).unwrap().unwrap();
        assert_eq!(retired, 0..2);
        assert_eq!(q.active_seq(), 2);
    }

    #[test]
    fn far_jump_retires_at_most_a_window() {
        let mut q = queue();
        q.insert(frame(2, 0)).unwrap();
        let (retired, _) = q.insert(frame(1_000_000, 1_000_000)).unwrap().unwrap();
        assert_eq!(retired, 0..WINDOW);
        assert_eq!(q.active_seq(), 1_000_000);
    }

    #[test]
    fn rejects_sequences_past_the_window() {
        let mut q = queue();
        for seq in 1..WINDOW {
            q.insert(frame(seq, 0)).unwrap();
        }
        assert_eq!(q.insert(frame(WINDOW, 0)), Err(InsertError::ExceedsLimit));

        // The window is anchored at the active CID, so switching makes room
        q.next().unwrap();
        q.insert(frame(WINDOW, 0)).unwrap();
        assert_eq!(
            q.insert(frame(WINDOW + 1, 0)),
            Err(InsertError::ExceedsLimit)
        );
    }

    #[test]
    fn rejects_retired_sequences() {
        let mut q = queue();
        assert_eq!(
            q.insert(frame(0, 0)),
            Ok(None),
            "re-announcing the active CID is harmless"
        );
        assert!(q.next().is_none(), "the active CID is not its own spare");
        q.insert(frame(1, 0)).unwrap();
        q.next().unwrap();
        assert_eq!(q.insert(frame(0, 0)), Err(InsertError::Retired));
    }
}
