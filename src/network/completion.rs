use std::any::type_name;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, trace, warn};

use super::engine::{EngineInner, IoGuard, NetEvents};
use crate::Shutdown;

const MONITOR_INTERVAL: Duration = Duration::from_secs(5);
const WORKER_CHECK_TIMEOUT: Duration = Duration::from_millis(200);

/// One entry on the completion queue.
pub(crate) enum Event<H: NetEvents> {
    Io(Completion<H>),
    /// Termination sentinel: a worker that sees it re-posts it for the next
    /// worker and exits, so one sentinel fans out to the whole pool.
    Shutdown,
}

/// A finished asynchronous operation. The guard is the operation's
/// in-flight token; dropping it after dispatch is the one UnlockPrevent for
/// this operation.
pub(crate) struct Completion<H: NetEvents> {
    pub(crate) kind: CompletionKind,
    pub(crate) guard: IoGuard<H>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompletionKind {
    Recv { transferred: usize },
    Send,
}

struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

/// Spawn the fixed pool of completion workers plus a monitor that restarts
/// any worker a callback panic takes down. Each worker blocks on the queue,
/// identifies the finished operation, dispatches it, and retires the
/// operation's guard — exactly once, aborted completions included.
pub(crate) fn start_workers<H: NetEvents>(
    inner: &Arc<EngineInner<H>>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
) {
    let count = inner.config.resolved_worker_tasks();
    let mut workers = Vec::with_capacity(count);
    for id in 0..count {
        workers.push(spawn_worker(id, inner.clone(), shutdown_complete_tx.clone()));
    }
    spawn_monitor(workers, inner.clone(), notify_shutdown, shutdown_complete_tx);
}

fn spawn_worker<H: NetEvents>(
    id: usize,
    inner: Arc<EngineInner<H>>,
    shutdown_complete_tx: mpsc::Sender<()>,
) -> Worker {
    let completions_rx = inner.completions_rx.clone();
    let completions_tx = inner.completions_tx.clone();
    let handle = tokio::spawn(async move {
        debug!("completion worker {id} started");
        while let Ok(event) = completions_rx.recv().await {
            match event {
                Event::Shutdown => {
                    let _ = completions_tx.send(Event::Shutdown).await;
                    break;
                }
                Event::Io(completion) => inner.dispatch(completion),
            }
        }
        debug!("completion worker {id} exited");
        drop(shutdown_complete_tx);
    });
    Worker { id, handle }
}

fn spawn_monitor<H: NetEvents>(
    mut workers: Vec<Worker>,
    inner: Arc<EngineInner<H>>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
) {
    let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
    tokio::spawn(async move {
        let mut interval = time::interval(MONITOR_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("worker monitor received shutdown signal");
                    break;
                }
                _ = interval.tick() => {}
            }
            let mut kept = Vec::with_capacity(workers.len());
            for mut worker in workers.drain(..) {
                match time::timeout(WORKER_CHECK_TIMEOUT, &mut worker.handle).await {
                    Err(_) => kept.push(worker), // still running
                    Ok(Ok(_)) => {
                        // normal exit through the sentinel; nothing to restart
                    }
                    Ok(Err(join_error)) => {
                        if join_error.is_panic() {
                            log_worker_panic(worker.id, join_error);
                        } else {
                            error!("completion worker {} failed without a panic", worker.id);
                        }
                        warn!("completion worker {} restarting", worker.id);
                        kept.push(spawn_worker(
                            worker.id,
                            inner.clone(),
                            shutdown_complete_tx.clone(),
                        ));
                    }
                }
            }
            workers = kept;
            if workers.is_empty() {
                break;
            }
        }
        debug!("worker monitor exiting");
        drop(shutdown_complete_tx);
    });
}

fn log_worker_panic(worker_id: usize, err: tokio::task::JoinError) {
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        error!("completion worker {worker_id} panicked with message: {message}");
    } else if let Some(message) = payload.downcast_ref::<String>() {
        error!("completion worker {worker_id} panicked with message: {message}");
    } else {
        error!(
            "completion worker {worker_id} panicked with an unknown type: {}",
            get_type_name(&payload)
        );
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}

impl<H: NetEvents> EngineInner<H> {
    fn dispatch(&self, completion: Completion<H>) {
        let Completion { kind, guard } = completion;
        match kind {
            // zero transferred bytes: peer closed, wait aborted, or the
            // transfer failed. No application dispatch; flush queued output
            // and half-close.
            CompletionKind::Recv { transferred: 0 } => {
                trace!("session {} recv aborted", guard.session().uid());
                self.post_send(guard.slot());
                guard.session().begin_close();
            }
            CompletionKind::Recv { transferred } => self.after_recv_process(&guard, transferred),
            CompletionKind::Send => self.after_send_process(&guard),
        }
        // guard drops here: the operation's one UnlockPrevent
    }
}
