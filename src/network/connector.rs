use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

use super::completion::{start_workers, Event};
use super::engine::{Engine, EngineInner, NetEvents};
use super::sender::start_send_scheduler;
use crate::message::Message;
use crate::session::SessionUid;
use crate::{AppError, AppResult, EngineConfig};

/// Connect-side front end: the same engine core as [`super::NetServer`],
/// brought up for a single outbound session.
pub struct NetClient<H: NetEvents> {
    inner: Arc<EngineInner<H>>,
    uid: SessionUid,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
}

impl<H: NetEvents> NetClient<H> {
    pub async fn connect(config: EngineConfig, handler: H) -> AppResult<NetClient<H>> {
        config.validate()?;
        let mut config = config;
        // the client engine drives exactly one session
        config.network.max_sessions = 1;

        let peer_address = format!("{}:{}", config.network.ip, config.network.port);
        let socket = TcpStream::connect(&peer_address).await.map_err(|e| {
            let error_msg = format!("failed to connect to {peer_address}: {e}");
            error!(error_msg);
            AppError::DetailedIoError(error_msg)
        })?;
        let peer = socket.peer_addr()?;
        info!("tcp client connected to {peer}");

        let inner = EngineInner::new(config, handler);
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);

        start_workers(&inner, notify_shutdown.clone(), shutdown_complete_tx.clone());
        start_send_scheduler(
            inner.clone(),
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        );

        let uid = inner.bring_up(socket, peer).ok_or_else(|| {
            AppError::IllegalStateError("client session slot unavailable".to_string())
        })?;

        Ok(NetClient {
            inner,
            uid,
            notify_shutdown,
            shutdown_complete_tx,
            shutdown_complete_rx,
        })
    }

    pub fn session(&self) -> SessionUid {
        self.uid
    }

    pub fn is_connected(&self) -> bool {
        self.inner.table.lookup(self.uid).is_some()
    }

    /// Remote address of the session, while it is live.
    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.table.lookup(self.uid)?.peer()
    }

    pub fn send(&self, payload: &[u8]) -> bool {
        self.inner.send_bytes(self.uid, payload)
    }

    pub fn send_message(&self, message: Message) -> bool {
        self.inner.enqueue_message(self.uid, message)
    }

    pub fn disconnect(&self) -> bool {
        self.inner.disconnect_session(self.uid)
    }

    pub fn allocate_message(&self) -> Message {
        self.inner.message_pool.allocate()
    }

    pub fn free_message(&self, message: Message) {
        self.inner.message_pool.free(message);
    }

    pub fn engine(&self) -> &dyn Engine {
        &*self.inner
    }

    /// Resolves once the session has been fully released, whichever side
    /// closed first.
    pub async fn closed(&self) {
        self.inner.wait_drained().await;
    }

    /// Graceful shutdown of the client engine: half-close, bounded drain
    /// wait, worker-pool termination.
    pub async fn shutdown(mut self) {
        info!("net client session {} shutting down", self.uid);
        let _ = self.notify_shutdown.send(());
        self.inner.drain_all().await;
        let _ = self.inner.completions_tx.send(Event::Shutdown).await;
        drop(self.shutdown_complete_tx);
        let _ = self.shutdown_complete_rx.recv().await;
        info!("net client shutdown complete");
    }
}
