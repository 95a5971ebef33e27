use std::io::{self, IoSlice};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tracing::{debug, error, trace};

use super::completion::{Completion, CompletionKind, Event};
use super::engine::{EngineInner, IoGuard, NetEvents};
use crate::Shutdown;

/// Spawn the send scheduler: a single task that scans the session table on a
/// fixed interval and flushes every session with queued output and no send
/// already in flight. The interval trades a small, bounded latency for not
/// needing any per-send wake-up machinery.
pub(crate) fn start_send_scheduler<H: NetEvents>(
    inner: Arc<EngineInner<H>>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
) {
    let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
    tokio::spawn(async move {
        let tick = Duration::from_millis(inner.config.workers.send_flush_interval_ms.max(1));
        let mut interval = time::interval(tick);
        debug!("send scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {}
            }
            for slot in 0..inner.table.capacity() {
                let session = inner.table.slot(slot);
                if session.is_released() {
                    continue;
                }
                if session.send_q.lock().is_empty() {
                    continue;
                }
                if !session.send_pending.lock().is_empty() {
                    continue; // a send is already outstanding
                }
                inner.post_send(slot);
            }
        }
        debug!("send scheduler exited");
        drop(shutdown_complete_tx);
    });
}

impl<H: NetEvents> EngineInner<H> {
    /// Stage up to one batch of queued messages and post the gather write.
    /// The pending queue is the at-most-one-send-in-flight gate: staging is
    /// refused while it is non-empty, and it empties only when the previous
    /// send's completion has been processed.
    pub(crate) fn post_send(&self, slot: usize) {
        let Some(this) = self.shared() else {
            return;
        };
        let Some(guard) = IoGuard::acquire(&this, slot) else {
            return;
        };
        let session = guard.session();

        if session.send_q.lock().len() > self.config.workers.send_backlog_limit {
            error!(
                "send backlog overflow on session {}, dropping connection",
                session.uid()
            );
            session.begin_close();
            return;
        }

        {
            let mut pending = session.send_pending.lock();
            if !pending.is_empty() {
                return;
            }
            let mut queue = session.send_q.lock();
            if queue.is_empty() {
                return;
            }
            let batch = queue.len().min(self.config.workers.send_batch_max);
            pending.extend(queue.drain(..batch));
        }

        tokio::spawn(async move {
            if !this.flush_pending(guard.slot()).await {
                guard.session().begin_close();
            }
            let completion = Completion {
                kind: CompletionKind::Send,
                guard,
            };
            if this
                .completions_tx
                .send(Event::Io(completion))
                .await
                .is_err()
            {
                trace!("completion queue closed while delivering send completion");
            }
        });
    }

    /// Write every staged frame, as one vectored call per readiness round,
    /// until the batch is fully on the wire. Partial writes pick up at the
    /// exact byte offset where the socket stalled.
    async fn flush_pending(&self, slot: usize) -> bool {
        let session = self.table.slot(slot);
        let Some(socket) = session.socket() else {
            return false;
        };
        let mut written = 0usize;
        loop {
            if socket.writable().await.is_err() {
                return false;
            }
            let pending = session.send_pending.lock();
            let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(pending.len());
            let mut skip = written;
            let mut total = 0usize;
            for message in pending.iter() {
                let frame = message.frame_bytes();
                total += frame.len();
                if skip >= frame.len() {
                    skip -= frame.len();
                    continue;
                }
                slices.push(IoSlice::new(&frame[skip..]));
                skip = 0;
            }
            if written >= total {
                return true;
            }
            match socket.try_write_vectored(&slices) {
                Ok(n) => {
                    written += n;
                    if written >= total {
                        return true;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    error!("send failed on session {}: {e}", session.uid());
                    return false;
                }
            }
        }
    }

    /// Send completion: every message of the finished batch goes back to the
    /// pool, which also reopens the in-flight gate for the scheduler.
    pub(crate) fn after_send_process(&self, guard: &IoGuard<H>) {
        let session = guard.session();
        let mut pending = session.send_pending.lock();
        while let Some(message) = pending.pop_front() {
            self.message_pool.free(message);
        }
    }
}
