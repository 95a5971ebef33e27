use std::fmt;
use std::sync::Arc;

use super::Session;

/// Identifier for one session activation: the table slot index in the low
/// half, the slot's generation counter in the high half. The slot gives O(1)
/// table lookup; the generation makes a uid from a previous occupant of the
/// same slot stale instead of silently addressing its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionUid(u64);

impl SessionUid {
    pub(crate) fn new(slot: usize, generation: u32) -> SessionUid {
        SessionUid(((generation as u64) << 32) | slot as u64)
    }

    pub(crate) fn from_u64(raw: u64) -> SessionUid {
        SessionUid(raw)
    }

    pub fn slot(&self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    pub fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed arena of session slots plus a queue of free slot indices.
///
/// Slots are allocated once, sized to the configured maximum number of
/// concurrent sessions, and recycled for the process lifetime. Accept and
/// release run on different tasks, so the free queue is a concurrent channel.
pub(crate) struct SessionTable {
    slots: Vec<Arc<Session>>,
    free_tx: async_channel::Sender<usize>,
    free_rx: async_channel::Receiver<usize>,
}

impl SessionTable {
    pub(crate) fn new(max_sessions: usize, ring_capacity: usize) -> SessionTable {
        let max_sessions = max_sessions.max(1);
        let slots = (0..max_sessions)
            .map(|slot| Arc::new(Session::new(slot, ring_capacity)))
            .collect();
        let (free_tx, free_rx) = async_channel::bounded(max_sessions);
        for slot in 0..max_sessions {
            // the queue is sized to hold every index
            let _ = free_tx.try_send(slot);
        }
        SessionTable {
            slots,
            free_tx,
            free_rx,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slot(&self, slot: usize) -> &Arc<Session> {
        &self.slots[slot]
    }

    /// Look up a live session by uid; stale or released uids miss.
    pub(crate) fn lookup(&self, uid: SessionUid) -> Option<&Arc<Session>> {
        let session = self.slots.get(uid.slot())?;
        session.matches(uid).then_some(session)
    }

    pub(crate) fn acquire_slot(&self) -> Option<usize> {
        self.free_rx.try_recv().ok()
    }

    pub(crate) fn release_slot(&self, slot: usize) {
        let _ = self.free_tx.try_send(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_packs_slot_and_generation() {
        let uid = SessionUid::new(42, 7);
        assert_eq!(uid.slot(), 42);
        assert_eq!(uid.generation(), 7);
        assert_eq!(SessionUid::from_u64(uid.as_u64()), uid);
    }

    #[test]
    fn acquire_exhausts_and_release_replenishes() {
        let table = SessionTable::new(2, 64);
        let a = table.acquire_slot().unwrap();
        let b = table.acquire_slot().unwrap();
        assert_ne!(a, b);
        assert!(table.acquire_slot().is_none());
        table.release_slot(a);
        assert_eq!(table.acquire_slot(), Some(a));
    }

    #[test]
    fn reuse_bumps_generation_and_stales_old_uid() {
        let table = SessionTable::new(1, 64);
        let slot = table.acquire_slot().unwrap();
        let first = table.slot(slot).activate_detached();
        assert!(table.lookup(first).is_some());

        // tear the session down and recycle the slot
        assert!(table.slot(slot).acquire_io());
        assert!(table.slot(slot).release_io());
        table.release_slot(slot);

        assert!(table.lookup(first).is_none());

        let slot = table.acquire_slot().unwrap();
        let second = table.slot(slot).activate_detached();
        assert_eq!(second.slot(), first.slot());
        assert!(second.generation() > first.generation());
        assert!(table.lookup(first).is_none());
        assert!(table.lookup(second).is_some());
    }
}
