//! Watch listener.
//!
//! A background worker owning the read side of the dedicated watch socket.
//! The server pushes one [`KeyUpdate`] event per mutation of a watched key;
//! the worker decodes each event and invokes the callback registered for
//! that key. Callbacks run synchronously on the worker, so they must not
//! block indefinitely and must tolerate being called off the caller's
//! thread.

use std::{collections::HashMap, sync::Arc};

use muster_proto::KeyUpdate;
use tokio::{
    io::BufReader,
    net::tcp::OwnedReadHalf,
    sync::{Mutex, oneshot},
    task::JoinHandle,
};

/// Callback invoked with the old and new value of a watched key.
pub type WatchCallback = Box<dyn Fn(String, String) + Send + 'static>;

/// Key → callback map shared between the client (registration) and the
/// listener worker (lookup and invoke). Registration happens before the
/// watch request leaves the process, so an event can never beat its
/// callback.
pub(crate) type CallbackMap = Arc<Mutex<HashMap<String, WatchCallback>>>;

/// Handle to the listener worker.
pub(crate) struct WatchListener {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WatchListener {
    /// Start the worker on a background task.
    pub(crate) fn spawn(read_half: OwnedReadHalf, callbacks: CallbackMap) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(listen(read_half, callbacks, shutdown_rx));
        Self { shutdown: Some(shutdown_tx), task: Some(task) }
    }

    /// Signal shutdown and wait for the worker to exit.
    pub(crate) async fn stop(&mut self) {
        self.shutdown.take();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::error!("watch listener failed during stop: {e}");
                }
            }
        }
    }
}

impl Drop for WatchListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Worker loop: one socket, one shutdown channel, one event at a time.
async fn listen(
    read_half: OwnedReadHalf,
    callbacks: CallbackMap,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut reader = BufReader::new(read_half);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::debug!("watch listener shutting down");
                break;
            },
            decoded = KeyUpdate::decode(&mut reader) => match decoded {
                Ok(update) => dispatch(&callbacks, update).await,
                Err(e) if e.is_eof() => {
                    tracing::debug!("watch socket closed by the server");
                    break;
                },
                Err(e) => {
                    // Unexpected tag or torn frame: the stream cannot be
                    // resynchronized, so the worker dies with it.
                    tracing::error!("watch event decode failed: {e}");
                    break;
                },
            },
        }
    }
}

async fn dispatch(callbacks: &CallbackMap, update: KeyUpdate) {
    let old = String::from_utf8_lossy(&update.old).into_owned();
    let new = String::from_utf8_lossy(&update.new).into_owned();

    match callbacks.lock().await.get(&update.key) {
        Some(callback) => callback(old, new),
        None => tracing::warn!("watch event for unregistered key {:?}", update.key),
    }
}
