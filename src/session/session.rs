use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::SessionUid;
use crate::buffer::RingBuffer;
use crate::message::Message;

/// In-flight operation count and the released flag, packed into one atomic
/// word so the final decrement and the flag transition are a single CAS. A
/// separate count and flag would admit an acquire between the zero-crossing
/// and the flag store, granting an operation on a session mid-teardown.
const RELEASED_BIT: u64 = 1 << 32;
const COUNT_MASK: u64 = RELEASED_BIT - 1;

/// State for one peer connection, living in a fixed table slot that is reused
/// for the process lifetime.
///
/// Lifetime is governed by `state`: every in-flight asynchronous operation
/// (and every public call that touches the session) holds one unit of the
/// count; teardown runs exactly once, for the caller whose decrement drains
/// the count to zero and atomically sets the released bit.
pub(crate) struct Session {
    slot: usize,
    uid: AtomicU64,
    generation: AtomicU32,
    state: AtomicU64,
    disconnecting: AtomicBool,
    socket: Mutex<Option<Arc<TcpStream>>>,
    peer: Mutex<Option<SocketAddr>>,
    cancel: Mutex<CancellationToken>,
    pub(crate) recv_ring: Mutex<RingBuffer>,
    pub(crate) send_q: Mutex<VecDeque<Message>>,
    pub(crate) send_pending: Mutex<VecDeque<Message>>,
}

impl Session {
    pub(crate) fn new(slot: usize, ring_capacity: usize) -> Session {
        Session {
            slot,
            uid: AtomicU64::new(0),
            generation: AtomicU32::new(0),
            // a slot starts out released; activate() brings it live
            state: AtomicU64::new(RELEASED_BIT),
            disconnecting: AtomicBool::new(false),
            socket: Mutex::new(None),
            peer: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            recv_ring: Mutex::new(RingBuffer::new(ring_capacity)),
            send_q: Mutex::new(VecDeque::new()),
            send_pending: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn uid(&self) -> SessionUid {
        SessionUid::from_u64(self.uid.load(Ordering::Acquire))
    }

    pub(crate) fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }

    pub(crate) fn socket(&self) -> Option<Arc<TcpStream>> {
        self.socket.lock().clone()
    }

    pub(crate) fn is_released(&self) -> bool {
        self.state.load(Ordering::Acquire) & RELEASED_BIT != 0
    }

    pub(crate) fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::Acquire)
    }

    pub(crate) fn matches(&self, uid: SessionUid) -> bool {
        !self.is_released() && self.uid() == uid
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Bind a freshly accepted or connected socket into this slot and assign
    /// the next-generation uid. The caller must own the slot exclusively
    /// (it came off the free queue).
    pub(crate) fn activate(&self, socket: TcpStream, peer: SocketAddr) -> SessionUid {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let uid = SessionUid::new(self.slot, generation);
        *self.socket.lock() = Some(Arc::new(socket));
        *self.peer.lock() = Some(peer);
        *self.cancel.lock() = CancellationToken::new();
        self.recv_ring.lock().reset();
        self.disconnecting.store(false, Ordering::Release);
        self.uid.store(uid.as_u64(), Ordering::Release);
        self.state.store(0, Ordering::Release);
        uid
    }

    /// PreventRelease: register one in-flight operation. Returns false if the
    /// session is already released; the caller must then balance with
    /// `release_io` all the same.
    pub(crate) fn acquire_io(&self) -> bool {
        let prev = self.state.fetch_add(1, Ordering::AcqRel);
        prev & RELEASED_BIT == 0
    }

    /// UnlockPrevent: retire one in-flight operation. Returns true exactly
    /// once per activation, for the caller whose decrement drains the count
    /// to zero and, in the same CAS, sets the released bit; that caller owns
    /// teardown.
    pub(crate) fn release_io(&self) -> bool {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            let count = cur & COUNT_MASK;
            debug_assert!(count > 0, "release_io without matching acquire_io");
            let released = cur & RELEASED_BIT != 0;
            let wins_teardown = count == 1 && !released;
            let next = if wins_teardown { RELEASED_BIT } else { cur - 1 };
            match self
                .state
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return wins_teardown,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Stop reposting receives and wake a parked receive wait. In-flight
    /// sends complete naturally; teardown follows once the io count drains.
    pub(crate) fn begin_close(&self) {
        self.disconnecting.store(true, Ordering::Release);
        self.cancel.lock().cancel();
    }

    /// Drop the socket (closing it once in-flight operations let go of their
    /// handles) and clear per-connection state. Runs only inside teardown.
    pub(crate) fn clear(&self) {
        self.cancel.lock().cancel();
        *self.socket.lock() = None;
        *self.peer.lock() = None;
        self.recv_ring.lock().reset();
    }

    #[cfg(test)]
    pub(crate) fn activate_detached(&self) -> SessionUid {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let uid = SessionUid::new(self.slot, generation);
        self.disconnecting.store(false, Ordering::Release);
        self.uid.store(uid.as_u64(), Ordering::Release);
        self.state.store(0, Ordering::Release);
        uid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn release_fires_exactly_once_after_last_unlock() {
        let session = Arc::new(Session::new(0, 64));
        session.activate_detached();

        // outer hold keeps the count above zero while the workers churn
        assert!(session.acquire_io());

        let mut workers = Vec::new();
        for _ in 0..8 {
            let session = session.clone();
            workers.push(thread::spawn(move || {
                let mut teardowns = 0;
                for _ in 0..10_000 {
                    let granted = session.acquire_io();
                    assert!(granted);
                    if session.release_io() {
                        teardowns += 1;
                    }
                }
                teardowns
            }));
        }
        let churn_teardowns: i32 = workers.into_iter().map(|w| w.join().unwrap()).sum();
        assert_eq!(churn_teardowns, 0);

        // dropping the last hold is the one and only teardown point
        assert!(session.release_io());
        assert!(session.is_released());

        // late arrivals are refused and must not tear down again
        assert!(!session.acquire_io());
        assert!(!session.release_io());
    }

    #[test]
    fn racing_acquires_never_outlive_teardown() {
        for _ in 0..200 {
            let session = Arc::new(Session::new(0, 8));
            session.activate_detached();

            let mut workers = Vec::new();
            for _ in 0..4 {
                let session = session.clone();
                workers.push(thread::spawn(move || {
                    let mut teardowns = 0;
                    for _ in 0..100 {
                        let granted = session.acquire_io();
                        if session.release_io() {
                            teardowns += 1;
                        }
                        if !granted {
                            break;
                        }
                    }
                    teardowns
                }));
            }
            let teardowns: i32 = workers.into_iter().map(|w| w.join().unwrap()).sum();

            // the first zero-crossing owns the one and only teardown;
            // every later acquire must be refused
            assert_eq!(teardowns, 1);
            assert!(session.is_released());
            assert!(!session.acquire_io());
            assert!(!session.release_io());
        }
    }

    #[test]
    fn acquire_refused_after_release() {
        let session = Session::new(3, 64);
        session.activate_detached();
        assert!(session.acquire_io());
        assert!(session.release_io());
        assert!(!session.acquire_io());
        assert!(!session.release_io());
    }

    #[test]
    fn activate_renews_uid_and_flags() {
        let session = Session::new(5, 64);
        let first = session.activate_detached();
        session.begin_close();
        assert!(session.acquire_io());
        assert!(session.release_io());

        let second = session.activate_detached();
        assert_ne!(first, second);
        assert_eq!(second.slot(), 5);
        assert_eq!(second.generation(), first.generation() + 1);
        assert!(!session.is_disconnecting());
        assert!(session.matches(second));
        assert!(!session.matches(first));
    }
}
