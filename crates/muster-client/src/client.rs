//! Client stub for the rendezvous store.
//!
//! Every operation serializes a request onto the request socket and, where
//! the protocol answers, receives the reply on the same socket under the
//! configured timeout. A second socket carries server-pushed watch events
//! to the [`WatchListener`] worker.
//!
//! User keys are sent with a `"/"` prefix; the startup barrier uses the
//! internal `"init/"` key, which the prefix keeps out of the user keyspace.

use std::{
    collections::HashMap,
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use muster_proto::{CheckReply, Request, WaitReply, read_blob, read_i64};
use muster_server::{Server, ServerConfig, ServerHandle};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpStream, tcp::OwnedWriteHalf},
    sync::Mutex,
};

use crate::{
    error::ClientError,
    listener::{CallbackMap, WatchListener},
};

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Prefix applied to every user key before transmission.
const KEY_PREFIX: &str = "/";

/// Internal barrier counter key; sent without the user prefix.
const INIT_KEY: &str = "init/";

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);
const BARRIER_POLL_DELAY: Duration = Duration::from_millis(10);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Server host or IP.
    pub host: String,
    /// Server port. With `is_server` and port 0 the OS picks one.
    pub port: u16,
    /// Worker-group size; enables the startup barrier when set.
    pub num_workers: Option<u64>,
    /// Run the authoritative server inside this process.
    pub is_server: bool,
    /// Per-call reply timeout. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Run the startup barrier during construction (needs `num_workers`).
    pub wait_workers: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 29500,
            num_workers: None,
            is_server: false,
            timeout: Some(DEFAULT_TIMEOUT),
            wait_workers: true,
        }
    }
}

/// Synchronous-feeling handle to the rendezvous store.
///
/// One request is in flight per client at a time; the request socket is
/// persistent and carries every call for the client's lifetime.
pub struct StoreClient {
    host: String,
    port: u16,
    timeout: Option<Duration>,
    request: TcpStream,
    watch_writer: OwnedWriteHalf,
    callbacks: CallbackMap,
    listener: WatchListener,
    server: Option<ServerHandle>,
}

impl StoreClient {
    /// Connect to the store, optionally hosting the server in-process.
    ///
    /// Construction order: bind and spawn the server (`is_server`), connect
    /// the request socket, run the startup barrier (`num_workers` +
    /// `wait_workers`), connect the watch socket and start the listener.
    /// If any step fails the resources already acquired are released in
    /// reverse order before the error propagates.
    ///
    /// # Errors
    ///
    /// [`ClientError::Server`] if the embedded server cannot bind;
    /// [`ClientError::Connect`] if the server never becomes reachable within
    /// the timeout; any transport or protocol failure from the barrier.
    pub async fn connect(config: StoreConfig) -> Result<Self, ClientError> {
        let StoreConfig { host, port, num_workers, is_server, timeout, wait_workers } = config;

        let mut server = None;
        let mut port = port;
        if is_server {
            let bound = Server::bind(ServerConfig {
                bind_address: format!("0.0.0.0:{port}"),
                ..ServerConfig::default()
            })
            .await?;
            port = bound.local_addr().port();
            server = Some(bound.spawn());
        }

        match Self::open(&host, port, num_workers, is_server, timeout, wait_workers).await {
            Ok((request, watch_writer, callbacks, listener)) => Ok(Self {
                host,
                port,
                timeout,
                request,
                watch_writer,
                callbacks,
                listener,
                server,
            }),
            Err(e) => {
                if let Some(server) = server {
                    server.shutdown().await;
                }
                Err(e)
            },
        }
    }

    async fn open(
        host: &str,
        port: u16,
        num_workers: Option<u64>,
        is_server: bool,
        timeout: Option<Duration>,
        wait_workers: bool,
    ) -> Result<(TcpStream, OwnedWriteHalf, CallbackMap, WatchListener), ClientError> {
        let mut request = connect_with_retry(host, port, timeout).await?;

        if let Some(num_workers) = num_workers {
            if wait_workers {
                barrier(&mut request, timeout, num_workers, is_server).await?;
            }
        }

        let watch_socket = connect_with_retry(host, port, timeout).await?;
        let (read_half, watch_writer) = watch_socket.into_split();
        let callbacks: CallbackMap = Arc::new(Mutex::new(HashMap::new()));
        let listener = WatchListener::spawn(read_half, Arc::clone(&callbacks));

        Ok((request, watch_writer, callbacks, listener))
    }

    /// Write a value unconditionally. Fire-and-forget: no reply.
    pub async fn set(&mut self, key: &str, value: &[u8]) -> Result<(), ClientError> {
        let request =
            Request::Set { key: self.prefixed(key), value: Bytes::copy_from_slice(value) };
        send_request(&mut self.request, &request).await
    }

    /// Compare-and-set, returning the value current after the request.
    ///
    /// On an absent key the server echoes `expected` back without writing
    /// anything, indistinguishable from a successful exchange. Seed keys
    /// with [`StoreClient::set`] before relying on the return value.
    pub async fn compare_set(
        &mut self,
        key: &str,
        expected: &[u8],
        desired: &[u8],
    ) -> Result<Bytes, ClientError> {
        let request = Request::CompareSet {
            key: self.prefixed(key),
            expected: Bytes::copy_from_slice(expected),
            desired: Bytes::copy_from_slice(desired),
        };
        send_request(&mut self.request, &request).await?;
        with_deadline(self.timeout, read_blob(&mut self.request)).await
    }

    /// Read a key, blocking server-side until it exists.
    ///
    /// Issues a wait for the key under the configured timeout, then the
    /// read. Never reports an absent key: the result is a value or an
    /// error, where a producer that is too slow surfaces as
    /// [`ClientError::Timeout`].
    pub async fn get(&mut self, key: &str) -> Result<Bytes, ClientError> {
        let key = self.prefixed(key);
        get_raw(&mut self.request, self.timeout, key).await
    }

    /// Add `delta` to the integer stored under `key`, returning the sum.
    ///
    /// An absent key counts as zero. The value is stored as a decimal
    /// string, so mixing `add` with a non-numeric `set` on the same key
    /// poisons it.
    pub async fn add(&mut self, key: &str, delta: i64) -> Result<i64, ClientError> {
        let key = self.prefixed(key);
        add_raw(&mut self.request, self.timeout, key, delta).await
    }

    /// Erase a key. Returns whether it existed.
    ///
    /// Watchers of the key are dropped silently; a waiter blocked on the
    /// key stays blocked until some future write.
    pub async fn delete_key(&mut self, key: &str) -> Result<bool, ClientError> {
        let request = Request::DeleteKey { key: self.prefixed(key) };
        send_request(&mut self.request, &request).await?;
        let erased = with_deadline(self.timeout, read_i64(&mut self.request)).await?;
        Ok(erased == 1)
    }

    /// Number of keys in the store, internal keys included.
    pub async fn get_num_keys(&mut self) -> Result<i64, ClientError> {
        send_request(&mut self.request, &Request::GetNumKeys).await?;
        with_deadline(self.timeout, read_i64(&mut self.request)).await
    }

    /// Non-blocking presence check over a key set.
    pub async fn check(&mut self, keys: &[&str]) -> Result<bool, ClientError> {
        let keys = keys.iter().map(|key| self.prefixed(key)).collect();
        send_request(&mut self.request, &Request::Check { keys }).await?;
        let verdict = with_deadline(self.timeout, CheckReply::decode(&mut self.request)).await?;
        Ok(verdict == CheckReply::Ready)
    }

    /// Block until every key in the set is present, under the configured
    /// timeout.
    pub async fn wait(&mut self, keys: &[&str]) -> Result<(), ClientError> {
        let keys = keys.iter().map(|key| self.prefixed(key)).collect();
        wait_raw(&mut self.request, self.timeout, keys).await
    }

    /// [`StoreClient::wait`] with a caller-chosen timeout for this call.
    pub async fn wait_with_timeout(
        &mut self,
        keys: &[&str],
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let keys = keys.iter().map(|key| self.prefixed(key)).collect();
        wait_raw(&mut self.request, Some(timeout), keys).await
    }

    /// Subscribe `callback` to every change of `key`.
    ///
    /// The callback receives the old and new value as strings (empty for an
    /// absent side) and runs on the listener worker. It is registered
    /// before the subscription request leaves the process, so the first
    /// event cannot race it. Deleting the key drops the subscription
    /// without an event.
    pub async fn watch_key(
        &mut self,
        key: &str,
        callback: impl Fn(String, String) + Send + 'static,
    ) -> Result<(), ClientError> {
        let key = self.prefixed(key);
        self.callbacks.lock().await.insert(key.clone(), Box::new(callback));

        // The subscription request goes out on the watch socket itself, the
        // same socket the events come back on.
        let mut buf = BytesMut::new();
        Request::WatchKey { key }.encode(&mut buf);
        self.watch_writer.write_all(&buf).await?;
        Ok(())
    }

    /// Host this client is connected to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port this client is connected to. Reflects the OS-assigned port when
    /// the embedded server was started with port 0.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop the background workers cleanly.
    ///
    /// Dropping the client instead aborts them; either way every socket is
    /// closed.
    pub async fn close(mut self) {
        self.listener.stop().await;
        if let Some(server) = self.server.take() {
            server.shutdown().await;
        }
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }
}

/// Encode and write one request.
async fn send_request(stream: &mut TcpStream, request: &Request) -> Result<(), ClientError> {
    let mut buf = BytesMut::new();
    request.encode(&mut buf);
    stream.write_all(&buf).await?;
    Ok(())
}

/// Await a reply future under an optional deadline.
async fn with_deadline<T>(
    limit: Option<Duration>,
    reply: impl std::future::Future<Output = muster_proto::Result<T>>,
) -> Result<T, ClientError> {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, reply).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ClientError::Timeout(limit)),
        },
        None => Ok(reply.await?),
    }
}

/// Wait for `keys`, already prefixed, on `stream`.
async fn wait_raw(
    stream: &mut TcpStream,
    limit: Option<Duration>,
    keys: Vec<String>,
) -> Result<(), ClientError> {
    send_request(stream, &Request::Wait { keys }).await?;
    with_deadline(limit, WaitReply::decode(stream)).await?;
    Ok(())
}

/// Wait for then read one key, already prefixed.
async fn get_raw(
    stream: &mut TcpStream,
    limit: Option<Duration>,
    key: String,
) -> Result<Bytes, ClientError> {
    wait_raw(stream, limit, vec![key.clone()]).await?;
    send_request(stream, &Request::Get { key }).await?;
    with_deadline(limit, read_blob(stream)).await
}

/// Increment one key, already prefixed.
async fn add_raw(
    stream: &mut TcpStream,
    limit: Option<Duration>,
    key: String,
    delta: i64,
) -> Result<i64, ClientError> {
    send_request(stream, &Request::Add { key, delta }).await?;
    with_deadline(limit, read_i64(stream)).await
}

/// Dial the server, retrying refused connections until the deadline.
///
/// The server host races its own workers to the rendezvous port, so a
/// refused connection usually means "not bound yet" rather than "down".
async fn connect_with_retry(
    host: &str,
    port: u16,
    limit: Option<Duration>,
) -> Result<TcpStream, ClientError> {
    let addr = format!("{host}:{port}");
    let start = Instant::now();

    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            },
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                if let Some(limit) = limit {
                    if start.elapsed() >= limit {
                        return Err(ClientError::Connect { addr, source: e });
                    }
                }
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            },
            Err(e) => return Err(ClientError::Connect { addr, source: e }),
        }
    }
}

/// Startup barrier over the internal counter key.
///
/// Every participant increments the counter once. The server host then
/// polls the counter until the whole group has checked in, which keeps the
/// in-process dispatcher alive for stragglers; a timeout ends the poll
/// silently. Other hosts return right after their increment.
async fn barrier(
    stream: &mut TcpStream,
    limit: Option<Duration>,
    num_workers: u64,
    is_server: bool,
) -> Result<(), ClientError> {
    add_raw(stream, limit, INIT_KEY.to_string(), 1).await?;

    if !is_server {
        return Ok(());
    }

    let start = Instant::now();
    loop {
        let value = get_raw(stream, limit, INIT_KEY.to_string()).await?;
        let completed = std::str::from_utf8(&value)
            .ok()
            .and_then(|text| text.parse::<u64>().ok())
            .ok_or(ClientError::CorruptBarrier)?;

        if completed >= num_workers {
            return Ok(());
        }
        if let Some(limit) = limit {
            if start.elapsed() > limit {
                return Ok(());
            }
        }
        tokio::time::sleep(BARRIER_POLL_DELAY).await;
    }
}
