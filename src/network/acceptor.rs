use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tracing::{debug, error, info, warn};

use super::completion::{start_workers, Event};
use super::engine::{Engine, EngineInner, NetEvents};
use super::sender::start_send_scheduler;
use crate::message::Message;
use crate::session::SessionUid;
use crate::{AppError, AppResult, EngineConfig, Shutdown};

/// Accept-side front end of the session engine.
///
/// `start` binds the listener and spawns the engine stages (completion
/// workers, send scheduler, acceptor); the returned handle exposes the
/// public session operations and the graceful shutdown sequence.
pub struct NetServer<H: NetEvents> {
    inner: Arc<EngineInner<H>>,
    local_addr: SocketAddr,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
}

impl<H: NetEvents> NetServer<H> {
    pub async fn start(config: EngineConfig, handler: H) -> AppResult<NetServer<H>> {
        config.validate()?;

        let listen_address = format!("{}:{}", config.network.ip, config.network.port);
        let listener = TcpListener::bind(&listen_address).await.map_err(|e| {
            let error_msg = format!("failed to bind server to address {listen_address}: {e}");
            error!(error_msg);
            AppError::DetailedIoError(error_msg)
        })?;
        let local_addr = listener.local_addr()?;
        info!("tcp server binding to {local_addr} for listening");

        let inner = EngineInner::new(config, handler);
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);

        start_workers(&inner, notify_shutdown.clone(), shutdown_complete_tx.clone());
        start_send_scheduler(
            inner.clone(),
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        );
        {
            let inner = inner.clone();
            let shutdown = Shutdown::new(notify_shutdown.subscribe());
            let shutdown_complete_tx = shutdown_complete_tx.clone();
            tokio::spawn(async move {
                run_acceptor(inner, listener, shutdown).await;
                drop(shutdown_complete_tx);
            });
        }

        Ok(NetServer {
            inner,
            local_addr,
            notify_shutdown,
            shutdown_complete_tx,
            shutdown_complete_rx,
        })
    }

    /// Address the listener actually bound — useful with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn send(&self, session: SessionUid, payload: &[u8]) -> bool {
        self.inner.send_bytes(session, payload)
    }

    pub fn send_message(&self, session: SessionUid, message: Message) -> bool {
        self.inner.enqueue_message(session, message)
    }

    pub fn disconnect(&self, session: SessionUid) -> bool {
        self.inner.disconnect_session(session)
    }

    pub fn allocate_message(&self) -> Message {
        self.inner.message_pool.allocate()
    }

    pub fn free_message(&self, message: Message) {
        self.inner.message_pool.free(message);
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.active_count()
    }

    /// The capability surface callbacks receive; handy for callers that want
    /// one object to thread through their own code.
    pub fn engine(&self) -> &dyn Engine {
        &*self.inner
    }

    /// Graceful shutdown: stop accepting and scheduling, disconnect every
    /// active session, wait (bounded) for the table to drain, then terminate
    /// the worker pool through the completion-queue sentinel.
    pub async fn shutdown(mut self) {
        info!("net server on {} shutting down", self.local_addr);
        let _ = self.notify_shutdown.send(());
        self.inner.drain_all().await;
        let _ = self.inner.completions_tx.send(Event::Shutdown).await;
        drop(self.shutdown_complete_tx);
        let _ = self.shutdown_complete_rx.recv().await;
        info!("net server shutdown complete");
    }
}

async fn run_acceptor<H: NetEvents>(
    inner: Arc<EngineInner<H>>,
    listener: TcpListener,
    mut shutdown: Shutdown,
) {
    debug!("acceptor started");
    loop {
        let accepted = tokio::select! {
            _ = shutdown.recv() => break,
            res = listener.accept() => res,
        };
        match accepted {
            Ok((socket, peer)) => admit(&inner, socket, peer),
            Err(e) => {
                // transient accept failures (peer reset, fd pressure) are
                // retried indefinitely
                warn!("accept failed: {e}, retrying");
                time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    debug!("acceptor exited");
}

fn admit<H: NetEvents>(inner: &Arc<EngineInner<H>>, socket: TcpStream, peer: SocketAddr) {
    if inner.active_count() >= inner.config.network.max_sessions {
        debug!("connection from {peer} refused: session table full");
        return; // dropping the socket closes it
    }
    if !inner.handler.on_connection_request(peer) {
        debug!("connection from {peer} vetoed by connection gate");
        return;
    }
    if inner.bring_up(socket, peer).is_none() {
        debug!("connection from {peer} refused: no free session slot");
    }
}
