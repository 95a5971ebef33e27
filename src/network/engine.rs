use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time;
use tracing::{debug, warn};

use crate::message::{FrameKind, LocalPool, Message, MessagePool, MAX_PAYLOAD_SIZE};
use crate::session::{Session, SessionTable, SessionUid};
use crate::EngineConfig;

/// Callbacks the external caller implements. The engine invokes them from
/// its worker tasks; implementations must not block.
pub trait NetEvents: Send + Sync + 'static {
    /// Gate for a new inbound connection, consulted before any session state
    /// exists. Returning false closes the socket on the spot.
    fn on_connection_request(&self, peer: SocketAddr) -> bool {
        let _ = peer;
        true
    }

    fn on_client_join(&self, session: SessionUid);

    /// One complete frame, in network arrival order. The frame buffer is
    /// only valid for the duration of the call.
    fn on_recv(&self, engine: &dyn Engine, session: SessionUid, frame: &Message);

    fn on_client_leave(&self, session: SessionUid);
}

/// Operations the engine exposes back to its caller, usable from inside
/// callbacks and from outside through the server/client front ends.
pub trait Engine: Send + Sync {
    /// Queue a payload for delivery as one frame. Never blocks on the
    /// network. Fails if the session is unknown, stale, released, or
    /// already disconnecting, or if the payload exceeds the frame bound.
    fn send(&self, session: SessionUid, payload: &[u8]) -> bool;

    /// Queue a caller-built message. The message returns to the pool on
    /// failure as well as after transmission.
    fn send_message(&self, session: SessionUid, message: Message) -> bool;

    /// Request a half-close: queued output is flushed, no further input is
    /// read, and teardown follows once in-flight operations drain.
    fn disconnect(&self, session: SessionUid) -> bool;

    fn allocate_message(&self) -> Message;

    fn free_message(&self, message: Message);

    fn active_sessions(&self) -> usize;
}

pub(crate) struct EngineInner<H: NetEvents> {
    pub(crate) config: EngineConfig,
    pub(crate) handler: H,
    pub(crate) table: SessionTable,
    pub(crate) message_pool: MessagePool,
    pub(crate) frame_pool: LocalPool<Message>,
    pub(crate) completions_tx: async_channel::Sender<super::completion::Event<H>>,
    pub(crate) completions_rx: async_channel::Receiver<super::completion::Event<H>>,
    active_count: AtomicUsize,
    drained: Notify,
    self_ref: Weak<EngineInner<H>>,
}

impl<H: NetEvents> EngineInner<H> {
    pub(crate) fn new(config: EngineConfig, handler: H) -> Arc<EngineInner<H>> {
        let (completions_tx, completions_rx) =
            async_channel::bounded(config.workers.completion_queue_capacity);
        Arc::new_cyclic(|self_ref| EngineInner {
            table: SessionTable::new(config.network.max_sessions, config.buffers.ring_capacity),
            message_pool: MessagePool::new(config.buffers.message_pool_capacity),
            frame_pool: LocalPool::new(config.buffers.local_pool_chunk),
            completions_tx,
            completions_rx,
            active_count: AtomicUsize::new(0),
            drained: Notify::new(),
            self_ref: self_ref.clone(),
            handler,
            config,
        })
    }

    /// The owning Arc, recovered through the cyclic self reference. Yields
    /// None only while the engine is already being dropped.
    pub(crate) fn shared(&self) -> Option<Arc<EngineInner<H>>> {
        self.self_ref.upgrade()
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    /// Bind a fresh socket into a free slot and run the session bring-up
    /// sequence: activate, join callback, first posted receive. Returns None
    /// when the table is exhausted (the socket drops, closing it).
    pub(crate) fn bring_up(&self, socket: TcpStream, peer: SocketAddr) -> Option<SessionUid> {
        let this = self.shared()?;
        let slot = self.table.acquire_slot()?;
        if let Err(e) = socket.set_nodelay(self.config.network.tcp_nodelay) {
            warn!("set_nodelay failed for peer {peer}: {e}");
        }
        let session = self.table.slot(slot);
        // raise the count before the session goes live: release decrements it
        self.active_count.fetch_add(1, Ordering::AcqRel);
        let uid = session.activate(socket, peer);

        let guard = IoGuard::acquire(&this, slot)?;
        debug!("session {uid} established with peer {peer}");
        self.handler.on_client_join(uid);
        self.post_recv(slot);
        drop(guard);
        Some(uid)
    }

    /// Validated guard for a public operation addressing a session by uid.
    fn guard_for(&self, uid: SessionUid) -> Option<IoGuard<H>> {
        if uid.slot() >= self.table.capacity() {
            return None;
        }
        let this = self.shared()?;
        let guard = IoGuard::acquire(&this, uid.slot())?;
        if guard.session().uid() != uid {
            return None; // stale uid from a recycled slot
        }
        Some(guard)
    }

    pub(crate) fn send_bytes(&self, uid: SessionUid, payload: &[u8]) -> bool {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return false;
        }
        let mut message = self.message_pool.allocate();
        message.set_kind(FrameKind::User);
        if !message.put(payload) {
            self.message_pool.free(message);
            return false;
        }
        self.enqueue_message(uid, message)
    }

    pub(crate) fn enqueue_message(&self, uid: SessionUid, message: Message) -> bool {
        let Some(guard) = self.guard_for(uid) else {
            self.message_pool.free(message);
            return false;
        };
        let session = guard.session();
        if session.is_disconnecting() {
            self.message_pool.free(message);
            return false;
        }
        session.send_q.lock().push_back(message);
        true
    }

    pub(crate) fn disconnect_session(&self, uid: SessionUid) -> bool {
        let Some(guard) = self.guard_for(uid) else {
            return false;
        };
        // one final flush so output queued before the disconnect still leaves
        self.post_send(guard.slot());
        guard.session().begin_close();
        true
    }

    /// Teardown. Runs exactly once per activation, on whichever caller won
    /// the released CAS after the io count drained to zero.
    pub(crate) fn release_session(&self, slot: usize) {
        let session = self.table.slot(slot);
        let uid = session.uid();
        debug!("releasing session {uid}");
        session.clear();
        {
            let mut pending = session.send_pending.lock();
            while let Some(message) = pending.pop_front() {
                self.message_pool.free(message);
            }
        }
        {
            let mut queue = session.send_q.lock();
            while let Some(message) = queue.pop_front() {
                self.message_pool.free(message);
            }
        }
        self.handler.on_client_leave(uid);
        self.table.release_slot(slot);
        if self.active_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Begin disconnect on every active session and wait, bounded by the
    /// configured timeout, for the table to drain.
    pub(crate) async fn drain_all(&self) {
        let Some(this) = self.shared() else {
            return;
        };
        for slot in 0..self.table.capacity() {
            if let Some(guard) = IoGuard::acquire(&this, slot) {
                self.post_send(slot);
                guard.session().begin_close();
            }
        }
        let timeout = Duration::from_millis(self.config.workers.shutdown_timeout_ms);
        if time::timeout(timeout, self.wait_drained()).await.is_err() {
            warn!(
                "shutdown drain timed out with {} sessions still active",
                self.active_count()
            );
        }
    }

    pub(crate) async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl<H: NetEvents> Engine for EngineInner<H> {
    fn send(&self, session: SessionUid, payload: &[u8]) -> bool {
        self.send_bytes(session, payload)
    }

    fn send_message(&self, session: SessionUid, message: Message) -> bool {
        self.enqueue_message(session, message)
    }

    fn disconnect(&self, session: SessionUid) -> bool {
        self.disconnect_session(session)
    }

    fn allocate_message(&self) -> Message {
        self.message_pool.allocate()
    }

    fn free_message(&self, message: Message) {
        self.message_pool.free(message);
    }

    fn active_sessions(&self) -> usize {
        self.active_count()
    }
}

/// RAII form of the PreventRelease/UnlockPrevent pair: constructing the guard
/// registers an in-flight operation, dropping it retires the operation, and
/// the drop that drains the io count to zero performs the session teardown.
/// Holding a guard therefore keeps teardown from racing any code that still
/// touches the session.
pub(crate) struct IoGuard<H: NetEvents> {
    inner: Arc<EngineInner<H>>,
    slot: usize,
}

impl<H: NetEvents> IoGuard<H> {
    /// Refuses (returning None) if the session is already released. The
    /// refused acquisition still routes its decrement through the release
    /// protocol so a concurrent drain cannot be missed.
    pub(crate) fn acquire(inner: &Arc<EngineInner<H>>, slot: usize) -> Option<IoGuard<H>> {
        let session = inner.table.slot(slot);
        if session.acquire_io() {
            return Some(IoGuard {
                inner: inner.clone(),
                slot,
            });
        }
        if session.release_io() {
            inner.release_session(slot);
        }
        None
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn session(&self) -> &Arc<Session> {
        self.inner.table.slot(self.slot)
    }
}

impl<H: NetEvents> Drop for IoGuard<H> {
    fn drop(&mut self) {
        if self.inner.table.slot(self.slot).release_io() {
            self.inner.release_session(self.slot);
        }
    }
}
