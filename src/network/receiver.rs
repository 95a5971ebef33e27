use std::io::{self, IoSliceMut};

use tracing::{error, trace};

use super::completion::{Completion, CompletionKind, Event};
use super::engine::{EngineInner, IoGuard, NetEvents};
use crate::message::FrameHeader;
use crate::AppError;

impl<H: NetEvents> EngineInner<H> {
    /// Post the session's next receive. At most one receive is outstanding
    /// per session — the next one is posted only after the previous
    /// completion has been parsed — so the recv ring needs no writer/writer
    /// coordination beyond its lock.
    pub(crate) fn post_recv(&self, slot: usize) {
        let Some(this) = self.shared() else {
            return;
        };
        let Some(guard) = IoGuard::acquire(&this, slot) else {
            return;
        };
        if guard.session().is_disconnecting() {
            // no repost: let the io count drain toward teardown
            return;
        }
        tokio::spawn(async move {
            let transferred = this.receive_once(guard.slot()).await;
            let completion = Completion {
                kind: CompletionKind::Recv { transferred },
                guard,
            };
            if this
                .completions_tx
                .send(Event::Io(completion))
                .await
                .is_err()
            {
                trace!("completion queue closed while delivering recv completion");
            }
        });
    }

    /// One posted receive: wait for readability (or abort), then scatter-read
    /// into the ring's free spans. Returns the transferred byte count;
    /// 0 stands for EOF, abort, and transfer errors alike.
    async fn receive_once(&self, slot: usize) -> usize {
        let session = self.table.slot(slot);
        let Some(socket) = session.socket() else {
            return 0;
        };
        let cancel = session.cancel_token();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return 0,
                ready = socket.readable() => {
                    if ready.is_err() {
                        return 0;
                    }
                }
            }
            let outcome = {
                let mut ring = session.recv_ring.lock();
                let (first, second) = ring.enqueue_spans();
                if first.is_empty() && second.is_empty() {
                    // ring full without a parseable frame; the parser treats
                    // that as a protocol violation before it can recur
                    Some(0)
                } else {
                    let mut bufs = [IoSliceMut::new(first), IoSliceMut::new(second)];
                    match socket.try_read_vectored(&mut bufs) {
                        Ok(n) => Some(n),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
                        Err(e) => {
                            error!("recv failed on session {}: {e}", session.uid());
                            Some(0)
                        }
                    }
                }
            };
            match outcome {
                Some(n) => return n,
                None => continue,
            }
        }
    }

    /// Recv completion: commit the transferred bytes, then drain every
    /// complete frame out of the ring. A single completion may carry zero,
    /// one, or many frames; a frame may span many completions.
    pub(crate) fn after_recv_process(&self, guard: &IoGuard<H>, transferred: usize) {
        let session = guard.session();
        let uid = session.uid();
        session.recv_ring.lock().move_head(transferred);

        loop {
            let mut ring = session.recv_ring.lock();
            let header = match FrameHeader::check_ring(&ring) {
                Ok(header) => header,
                // partial header or partial frame: consume nothing, wait
                Err(AppError::Incomplete) => break,
                Err(e) => {
                    drop(ring);
                    error!("protocol violation on session {uid}: {e}, dropping connection");
                    session.begin_close();
                    return; // no repost; the io count drains toward teardown
                }
            };
            let frame_len = header.frame_len();

            let mut message = self.frame_pool.allocate();
            if !ring.peek(message.frame_region_mut(frame_len)) {
                drop(ring);
                error!("recv ring lost {frame_len} buffered bytes on session {uid}");
                session.begin_close();
                return;
            }
            ring.move_tail(frame_len);
            drop(ring);

            self.handler.on_recv(self, uid, &message);
        }

        self.post_recv(guard.slot());
    }
}
