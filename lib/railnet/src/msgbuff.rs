//! Per-communicator message buffer: a wrapping ring indexed by the message
//! sequence number, holding the rendezvous state of every in-flight
//! message. Senders and receivers race benignly on a slot: whichever side
//! arrives first parks its half (a request, or a bounce buffer reference)
//! and the other side picks it up. The ratio of sequence space to ring size
//! bounds how many messages may be unfinished per peer pair; a slot that is
//! still in progress when its sequence number comes around again is a
//! protocol violation surfaced to the caller.

use crate::config::{MSGBUFF_SIZE, SEQ_SPACE};
use std::sync::Mutex;

/// What a slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemKind {
    /// A request posted by the local application.
    Req,
    /// A parked bounce-buffer reference from the peer (control message on
    /// the send side, eager payload on the receive side).
    Buf,
}

/// Progress of the message occupying a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    NotStarted,
    InProgress,
    Completed,
}

/// Outcome of `insert`/`replace`/`complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuffOutcome {
    Success,
    /// The slot was not in an insertable/replaceable state; carries what it
    /// held instead.
    InvalidIdx(SlotStatus),
}

/// Outcome of `retrieve`.
#[derive(Debug, Clone, Copy)]
pub enum Retrieve<E> {
    Found {
        elem: E,
        kind: ElemKind,
        status: SlotStatus,
    },
    /// Nothing has touched this sequence number yet.
    NotStarted,
}

#[derive(Clone, Copy)]
struct Slot<E> {
    seq: u16,
    status: SlotStatus,
    entry: Option<(E, ElemKind)>,
}

pub struct MsgBuff<E> {
    slots: Mutex<Vec<Slot<E>>>,
}

impl<E: Copy> MsgBuff<E> {
    pub fn new() -> MsgBuff<E> {
        MsgBuff {
            slots: Mutex::new(vec![
                Slot {
                    seq: 0,
                    status: SlotStatus::NotStarted,
                    entry: None,
                };
                MSGBUFF_SIZE
            ]),
        }
    }

    #[inline]
    fn index(seq: u16) -> usize {
        debug_assert!(seq < SEQ_SPACE);
        seq as usize % MSGBUFF_SIZE
    }

    /// Claim the slot for `seq` and park `elem` in it. Succeeds only when
    /// the slot is virgin or holds a completed message from an older
    /// generation of the ring.
    pub fn insert(&self, seq: u16, elem: E, kind: ElemKind) -> BuffOutcome {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[Self::index(seq)];

        match slot.status {
            SlotStatus::NotStarted => {}
            SlotStatus::Completed if slot.seq != seq => {
                // Older generation; the window has moved past it.
            }
            status => return BuffOutcome::InvalidIdx(status),
        }

        slot.seq = seq;
        slot.status = SlotStatus::InProgress;
        slot.entry = Some((elem, kind));
        BuffOutcome::Success
    }

    /// Overwrite the element of an in-progress slot, e.g. swapping a parked
    /// bounce reference for the request that consumed it.
    pub fn replace(&self, seq: u16, elem: E, kind: ElemKind) -> BuffOutcome {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[Self::index(seq)];

        if slot.status != SlotStatus::InProgress || slot.seq != seq {
            return BuffOutcome::InvalidIdx(slot.status);
        }

        slot.entry = Some((elem, kind));
        BuffOutcome::Success
    }

    pub fn retrieve(&self, seq: u16) -> Retrieve<E> {
        let slots = self.slots.lock().unwrap();
        let slot = &slots[Self::index(seq)];

        if slot.seq != seq && slot.status != SlotStatus::NotStarted {
            // The slot belongs to another generation of the ring.
            return Retrieve::NotStarted;
        }

        match (slot.status, slot.entry) {
            (SlotStatus::NotStarted, _) | (_, None) => Retrieve::NotStarted,
            (status, Some((elem, kind))) => Retrieve::Found { elem, kind, status },
        }
    }

    /// Mark the message done. The slot stays `Completed` until its sequence
    /// number wraps around and a new message claims it.
    pub fn complete(&self, seq: u16) -> BuffOutcome {
        let mut slots = self.slots.lock().unwrap();
        let slot = &mut slots[Self::index(seq)];

        if slot.status != SlotStatus::InProgress || slot.seq != seq {
            return BuffOutcome::InvalidIdx(slot.status);
        }

        slot.status = SlotStatus::Completed;
        slot.entry = None;
        BuffOutcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_retrieve_complete() {
        let buff: MsgBuff<u16> = MsgBuff::new();

        assert_eq!(buff.insert(5, 77, ElemKind::Req), BuffOutcome::Success);

        match buff.retrieve(5) {
            Retrieve::Found { elem, kind, status } => {
                assert_eq!(elem, 77);
                assert_eq!(kind, ElemKind::Req);
                assert_eq!(status, SlotStatus::InProgress);
            }
            Retrieve::NotStarted => panic!("expected occupied slot"),
        }

        assert_eq!(buff.complete(5), BuffOutcome::Success);
        assert!(matches!(buff.retrieve(5), Retrieve::NotStarted));
    }

    #[test]
    fn test_double_insert_rejected() {
        let buff: MsgBuff<u16> = MsgBuff::new();

        buff.insert(3, 1, ElemKind::Buf);
        assert_eq!(
            buff.insert(3, 2, ElemKind::Req),
            BuffOutcome::InvalidIdx(SlotStatus::InProgress)
        );
    }

    #[test]
    fn test_replace_requires_in_progress() {
        let buff: MsgBuff<u16> = MsgBuff::new();

        assert_eq!(
            buff.replace(4, 9, ElemKind::Req),
            BuffOutcome::InvalidIdx(SlotStatus::NotStarted)
        );

        buff.insert(4, 1, ElemKind::Buf);
        assert_eq!(buff.replace(4, 9, ElemKind::Req), BuffOutcome::Success);

        match buff.retrieve(4) {
            Retrieve::Found { elem, kind, .. } => {
                assert_eq!(elem, 9);
                assert_eq!(kind, ElemKind::Req);
            }
            _ => panic!("expected occupied slot"),
        }
    }

    #[test]
    fn test_wraparound_reuses_completed_slot() {
        let buff: MsgBuff<u16> = MsgBuff::new();
        let wrapped = MSGBUFF_SIZE as u16; // same ring slot as seq 0

        buff.insert(0, 1, ElemKind::Req);
        buff.complete(0);

        assert_eq!(buff.insert(wrapped, 2, ElemKind::Req), BuffOutcome::Success);
        match buff.retrieve(wrapped) {
            Retrieve::Found { elem, .. } => assert_eq!(elem, 2),
            _ => panic!("expected occupied slot"),
        }
    }

    #[test]
    fn test_window_overrun_rejected() {
        let buff: MsgBuff<u16> = MsgBuff::new();
        let wrapped = MSGBUFF_SIZE as u16;

        // Message 0 never completes; its slot cannot be reused by the next
        // generation.
        buff.insert(0, 1, ElemKind::Req);
        assert_eq!(
            buff.insert(wrapped, 2, ElemKind::Req),
            BuffOutcome::InvalidIdx(SlotStatus::InProgress)
        );
    }

    #[test]
    fn test_retrieve_other_generation_is_not_started() {
        let buff: MsgBuff<u16> = MsgBuff::new();

        buff.insert(1, 1, ElemKind::Req);
        buff.complete(1);

        // Peeking at the wrapped sequence must not expose the stale slot.
        assert!(matches!(
            buff.retrieve(1 + MSGBUFF_SIZE as u16),
            Retrieve::NotStarted
        ));
    }

    #[test]
    fn test_complete_twice_rejected() {
        let buff: MsgBuff<u16> = MsgBuff::new();

        buff.insert(9, 1, ElemKind::Req);
        buff.complete(9);
        assert_eq!(
            buff.complete(9),
            BuffOutcome::InvalidIdx(SlotStatus::Completed)
        );
    }
}
