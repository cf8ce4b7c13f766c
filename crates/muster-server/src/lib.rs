//! Muster production server.
//!
//! # Architecture
//!
//! [`StoreDriver`] is the action-based core: it owns the key-value map and
//! the wait/watch indices and never touches a socket. [`Server`] is the
//! production glue that executes driver actions over tokio TCP: an accept
//! loop multiplexed with a shutdown channel, one read task per peer, and a
//! shared map of write halves for replies and watch pushes.
//!
//! All store mutation funnels through one `Mutex<StoreDriver>`, and replies
//! go out while the lock is still held. A request's mutation and every send
//! it triggers are therefore applied as one atomic step, exactly as if a
//! single thread polled every socket.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod driver;
mod error;

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use bytes::BytesMut;
pub use driver::{DriverConfig, LogLevel, SessionId, StoreAction, StoreDriver, StoreEvent};
pub use error::{DriverError, ServerError};
use muster_proto::Request;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    sync::{Mutex, RwLock, oneshot},
    task::{JoinHandle, JoinSet},
};

/// Write halves of every live session, keyed by session ID.
///
/// Replies to a request and pushes to watcher sessions both go through this
/// map. The per-session mutex keeps concurrent writers from interleaving a
/// frame, though in practice the driver lock already serializes them.
type SessionMap = Arc<RwLock<HashMap<SessionId, Mutex<OwnedWriteHalf>>>>;

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to. Port 0 asks the OS to pick one; the result is
    /// observable through [`Server::local_addr`].
    pub bind_address: String,
    /// Driver configuration (session limits).
    pub driver: DriverConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_address: "127.0.0.1:29500".to_string(), driver: DriverConfig::default() }
    }
}

/// A bound but not yet running store server.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    driver: StoreDriver,
}

impl Server {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_address).await.map_err(|source| {
            ServerError::Bind { addr: config.bind_address.clone(), source }
        })?;
        let local_addr = listener.local_addr()?;
        tracing::info!("store server bound to {local_addr}");

        Ok(Self { listener, local_addr, driver: StoreDriver::new(config.driver) })
    }

    /// Address the server is actually listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start the accept loop on a background task.
    pub fn spawn(self) -> ServerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let local_addr = self.local_addr;
        let task = tokio::spawn(accept_loop(self.listener, self.driver, shutdown_rx));

        ServerHandle { local_addr, shutdown: Some(shutdown_tx), task: Some(task) }
    }
}

/// Handle to a running server.
///
/// The owner holds only this handle: the shutdown sender and the join
/// handle. Dropping the handle aborts the server; [`ServerHandle::shutdown`]
/// stops it cleanly (signal, then join, then sockets close on drop).
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal shutdown and wait for the server to wind down.
    pub async fn shutdown(mut self) {
        // Dropping the sender closes the channel; the accept loop observes
        // the closure and breaks.
        self.shutdown.take();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::error!("server task failed during shutdown: {e}");
                }
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Accept peers and multiplex the shutdown signal, mirroring a poll set
/// whose reserved slots are the listener and the control channel.
async fn accept_loop(
    listener: TcpListener,
    driver: StoreDriver,
    mut shutdown: oneshot::Receiver<()>,
) {
    let driver = Arc::new(Mutex::new(driver));
    let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));
    let mut workers = JoinSet::new();
    let mut next_session_id: SessionId = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            },
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    next_session_id += 1;
                    let session_id = next_session_id;
                    tracing::debug!("accepted {peer} as session {session_id}");
                    workers.spawn(handle_session(
                        session_id,
                        socket,
                        Arc::clone(&driver),
                        Arc::clone(&sessions),
                    ));
                },
                Err(e) => tracing::error!("accept failed: {e}"),
            },
        }
    }

    // Dropping the listener turns new peers away; aborting the workers
    // closes every accepted socket.
    workers.shutdown().await;
}

/// Serve one peer connection until it closes or errors.
async fn handle_session(
    session_id: SessionId,
    socket: TcpStream,
    driver: Arc<Mutex<StoreDriver>>,
    sessions: SessionMap,
) {
    if let Err(e) = socket.set_nodelay(true) {
        tracing::debug!("set_nodelay failed for session {session_id}: {e}");
    }

    let (read_half, write_half) = socket.into_split();
    sessions.write().await.insert(session_id, Mutex::new(write_half));

    {
        let mut driver = driver.lock().await;
        match driver.process_event(StoreEvent::SessionOpened { session_id }) {
            Ok(actions) => {
                let closed = execute_actions(actions, &sessions).await;
                if closed.contains(&session_id) {
                    return;
                }
            },
            Err(e) => {
                tracing::error!("session {session_id} rejected at open: {e}");
                drop(driver);
                sessions.write().await.remove(&session_id);
                return;
            },
        }
    }

    let mut reader = BufReader::new(read_half);
    let reason = loop {
        let request = match Request::decode(&mut reader).await {
            Ok(request) => request,
            Err(e) if e.is_eof() => break "peer closed the connection".to_string(),
            Err(e) => {
                tracing::warn!("session {session_id} sent a malformed request: {e}");
                break format!("protocol error: {e}");
            },
        };

        // Replies and watch pushes go out under the driver lock so every
        // socket observes effects in apply order.
        let mut driver = driver.lock().await;
        match driver.process_event(StoreEvent::RequestReceived { session_id, request }) {
            Ok(actions) => {
                let closed = execute_actions(actions, &sessions).await;
                if closed.contains(&session_id) {
                    break "closed by the store".to_string();
                }
            },
            Err(e) => {
                tracing::warn!("session {session_id} request failed: {e}");
                break format!("request failed: {e}");
            },
        }
    };

    sessions.write().await.remove(&session_id);

    let mut driver = driver.lock().await;
    match driver.process_event(StoreEvent::SessionClosed { session_id, reason }) {
        Ok(actions) => {
            execute_actions(actions, &sessions).await;
        },
        Err(e) => tracing::error!("purge of session {session_id} failed: {e}"),
    }
}

/// Execute driver actions. Returns the sessions that were closed.
async fn execute_actions(actions: Vec<StoreAction>, sessions: &SessionMap) -> Vec<SessionId> {
    let mut closed = Vec::new();

    for action in actions {
        match action {
            StoreAction::Send { session_id, reply } => {
                let mut buf = BytesMut::new();
                reply.encode(&mut buf);

                let map = sessions.read().await;
                match map.get(&session_id) {
                    Some(writer) => {
                        let mut writer = writer.lock().await;
                        // A dead peer fails here; it purges itself when its
                        // own read side reports the failure.
                        if let Err(e) = writer.write_all(&buf).await {
                            tracing::warn!("write to session {session_id} failed: {e}");
                        }
                    },
                    None => tracing::warn!("send to unknown session {session_id}"),
                }
            },

            StoreAction::Close { session_id, reason } => {
                tracing::info!("closing session {session_id}: {reason}");
                sessions.write().await.remove(&session_id);
                closed.push(session_id);
            },

            StoreAction::Log { level, message } => match level {
                LogLevel::Debug => tracing::debug!("{message}"),
                LogLevel::Info => tracing::info!("{message}"),
                LogLevel::Warn => tracing::warn!("{message}"),
                LogLevel::Error => tracing::error!("{message}"),
            },
        }
    }

    closed
}
