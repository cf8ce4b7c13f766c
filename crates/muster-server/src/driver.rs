//! Store driver.
//!
//! Owns the key-value map and the wait/watch indices, and turns protocol
//! events into actions. The driver performs no I/O of its own: the runtime
//! feeds it [`StoreEvent`]s and executes the returned [`StoreAction`]s.
//! Because every event passes through one driver, a request's mutation and
//! whatever sends it triggers land as one atomic step from any peer's
//! perspective.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use muster_proto::{CheckReply, KeyUpdate, Reply, Request};

use crate::error::DriverError;

/// Identifies one accepted peer connection.
pub type SessionId = u64;

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Maximum concurrent sessions; further peers are turned away.
    pub max_sessions: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { max_sessions: 10_000 }
    }
}

/// Events the runtime feeds into the driver.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A new peer connection was accepted.
    SessionOpened {
        /// Session ID assigned by the runtime.
        session_id: SessionId,
    },

    /// A complete request was decoded from a session.
    RequestReceived {
        /// Session that sent the request.
        session_id: SessionId,
        /// The decoded request.
        request: Request,
    },

    /// A connection ended, by the peer or by error.
    SessionClosed {
        /// Session that closed.
        session_id: SessionId,
        /// Reason for closure.
        reason: String,
    },
}

/// Actions the driver produces for the runtime to execute.
#[derive(Debug, Clone)]
pub enum StoreAction {
    /// Send a reply or watch event to a session.
    Send {
        /// Target session.
        session_id: SessionId,
        /// Message to deliver.
        reply: Reply,
    },

    /// Close a session.
    Close {
        /// Session to close.
        session_id: SessionId,
        /// Reason for closure.
        reason: String,
    },

    /// Emit a log line.
    Log {
        /// Log level.
        level: LogLevel,
        /// Message to log.
        message: String,
    },
}

/// Log levels for driver actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug information.
    Debug,
    /// Informational message.
    Info,
    /// Warning.
    Warn,
    /// Error.
    Error,
}

fn send(session_id: SessionId, reply: Reply) -> StoreAction {
    StoreAction::Send { session_id, reply }
}

/// The authoritative store and its rendezvous bookkeeping.
///
/// # Indices
///
/// - `waiting`: key → sessions blocked on that key, in registration order. A
///   session appears once per missing key of its wait set.
/// - `awaited`: session → remaining missing-key count. Reaching zero sends
///   one `StopWaiting` and drops the entry.
/// - `watchers`: key → sessions subscribed to change events, in
///   subscription order.
///
/// A disconnect purges its session from every index before any further
/// event is processed; the purge drops entries whose vectors empty out and
/// is idempotent.
pub struct StoreDriver {
    config: DriverConfig,
    store: HashMap<String, Bytes>,
    waiting: HashMap<String, Vec<SessionId>>,
    awaited: HashMap<SessionId, usize>,
    watchers: HashMap<String, Vec<SessionId>>,
    sessions: HashSet<SessionId>,
}

impl StoreDriver {
    /// Create an empty driver.
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            store: HashMap::new(),
            waiting: HashMap::new(),
            awaited: HashMap::new(),
            watchers: HashMap::new(),
            sessions: HashSet::new(),
        }
    }

    /// Process one event and return the actions to execute.
    ///
    /// # Errors
    ///
    /// A [`DriverError`] means the *originating* session must be closed and
    /// purged; the store and every other session stay consistent.
    pub fn process_event(&mut self, event: StoreEvent) -> Result<Vec<StoreAction>, DriverError> {
        match event {
            StoreEvent::SessionOpened { session_id } => Ok(self.handle_session_opened(session_id)),
            StoreEvent::RequestReceived { session_id, request } => {
                if !self.sessions.contains(&session_id) {
                    return Err(DriverError::UnknownSession(session_id));
                }
                self.handle_request(session_id, request)
            },
            StoreEvent::SessionClosed { session_id, reason } => {
                Ok(self.handle_session_closed(session_id, &reason))
            },
        }
    }

    fn handle_session_opened(&mut self, session_id: SessionId) -> Vec<StoreAction> {
        if self.sessions.len() >= self.config.max_sessions {
            return vec![StoreAction::Close {
                session_id,
                reason: "session limit reached".to_string(),
            }];
        }

        self.sessions.insert(session_id);
        vec![StoreAction::Log {
            level: LogLevel::Debug,
            message: format!("session {session_id} opened"),
        }]
    }

    fn handle_session_closed(&mut self, session_id: SessionId, reason: &str) -> Vec<StoreAction> {
        let known = self.sessions.contains(&session_id);
        self.purge(session_id);

        if known {
            vec![StoreAction::Log {
                level: LogLevel::Info,
                message: format!("session {session_id} closed: {reason}"),
            }]
        } else {
            Vec::new()
        }
    }

    fn handle_request(
        &mut self,
        session_id: SessionId,
        request: Request,
    ) -> Result<Vec<StoreAction>, DriverError> {
        match request {
            Request::Set { key, value } => Ok(self.handle_set(&key, value)),
            Request::CompareSet { key, expected, desired } => {
                Ok(self.handle_compare_set(session_id, key, expected, desired))
            },
            Request::Get { key } => self.handle_get(session_id, &key),
            Request::Add { key, delta } => self.handle_add(session_id, &key, delta),
            Request::Check { keys } => Ok(self.handle_check(session_id, &keys)),
            Request::Wait { keys } => Ok(self.handle_wait(session_id, keys)),
            Request::GetNumKeys => {
                Ok(vec![send(session_id, Reply::Int(self.store.len() as i64))])
            },
            Request::WatchKey { key } => Ok(self.handle_watch_key(session_id, key)),
            Request::DeleteKey { key } => Ok(self.handle_delete_key(session_id, &key)),
        }
    }

    fn handle_set(&mut self, key: &str, value: Bytes) -> Vec<StoreAction> {
        let old = self.store.get(key).cloned().unwrap_or_default();
        self.store.insert(key.to_string(), value.clone());

        // Waiters first, watchers second; both orderings are observable.
        let mut actions = self.wake_waiters(key);
        actions.extend(self.notify_watchers(key, old, value));
        actions
    }

    fn handle_compare_set(
        &mut self,
        session_id: SessionId,
        key: String,
        expected: Bytes,
        desired: Bytes,
    ) -> Vec<StoreAction> {
        match self.store.get(&key).cloned() {
            // An absent key echoes `expected` back even though nothing was
            // written, so the caller cannot tell this apart from a
            // successful exchange. Kept bit-for-bit for wire compatibility;
            // a distinct absent-key reply would break existing peers.
            None => vec![send(session_id, Reply::Value(expected))],
            Some(current) if current == expected => {
                self.store.insert(key.clone(), desired.clone());
                let mut actions = self.notify_watchers(&key, expected, desired.clone());
                actions.push(send(session_id, Reply::Value(desired)));
                actions
            },
            Some(current) => vec![send(session_id, Reply::Value(current))],
        }
    }

    fn handle_get(
        &mut self,
        session_id: SessionId,
        key: &str,
    ) -> Result<Vec<StoreAction>, DriverError> {
        let value = self
            .store
            .get(key)
            .cloned()
            .ok_or_else(|| DriverError::AbsentKey(key.to_string()))?;
        Ok(vec![send(session_id, Reply::Value(value))])
    }

    fn handle_add(
        &mut self,
        session_id: SessionId,
        key: &str,
        delta: i64,
    ) -> Result<Vec<StoreAction>, DriverError> {
        let old = self.store.get(key).cloned();
        // Wraps on i64 overflow rather than failing the session.
        let sum = match &old {
            Some(value) => parse_decimal(key, value)?.wrapping_add(delta),
            None => delta,
        };

        let new = Bytes::from(sum.to_string());
        self.store.insert(key.to_string(), new.clone());

        let mut actions = vec![send(session_id, Reply::Int(sum))];
        actions.extend(self.wake_waiters(key));
        actions.extend(self.notify_watchers(key, old.unwrap_or_default(), new));
        Ok(actions)
    }

    fn handle_check(&self, session_id: SessionId, keys: &[String]) -> Vec<StoreAction> {
        let verdict = if keys.iter().all(|key| self.store.contains_key(key)) {
            CheckReply::Ready
        } else {
            CheckReply::NotReady
        };
        vec![send(session_id, Reply::Check(verdict))]
    }

    fn handle_wait(&mut self, session_id: SessionId, keys: Vec<String>) -> Vec<StoreAction> {
        if keys.iter().all(|key| self.store.contains_key(key)) {
            return vec![send(session_id, Reply::StopWaiting)];
        }

        // Register under each missing key. A later write decrements the
        // counter once per key; the reply goes out when it reaches zero.
        // Single-driver dispatch makes this check-then-register race-free
        // against concurrent writes.
        let mut missing = 0;
        for key in keys {
            if !self.store.contains_key(&key) {
                self.waiting.entry(key).or_default().push(session_id);
                missing += 1;
            }
        }
        self.awaited.insert(session_id, missing);

        vec![StoreAction::Log {
            level: LogLevel::Debug,
            message: format!("session {session_id} waiting on {missing} keys"),
        }]
    }

    fn handle_watch_key(&mut self, session_id: SessionId, key: String) -> Vec<StoreAction> {
        let message = format!("session {session_id} watching {key:?}");
        self.watchers.entry(key).or_default().push(session_id);
        vec![StoreAction::Log { level: LogLevel::Debug, message }]
    }

    fn handle_delete_key(&mut self, session_id: SessionId, key: &str) -> Vec<StoreAction> {
        let erased = self.store.remove(key).is_some();

        // Watch subscriptions die with the key. Pending waiters do not: a
        // later write is the only thing that releases them.
        self.watchers.remove(key);

        vec![send(session_id, Reply::Int(i64::from(erased)))]
    }

    /// Release waiters whose last missing key just became present.
    ///
    /// Waiters are processed in registration order; each has its counter
    /// decremented exactly once, and those reaching zero get one
    /// `StopWaiting`. The key's waiter list is consumed whole.
    fn wake_waiters(&mut self, key: &str) -> Vec<StoreAction> {
        let Some(waiters) = self.waiting.remove(key) else {
            return Vec::new();
        };

        let mut actions = Vec::new();
        for session_id in waiters {
            let Some(remaining) = self.awaited.get_mut(&session_id) else {
                continue;
            };
            *remaining -= 1;
            if *remaining == 0 {
                self.awaited.remove(&session_id);
                actions.push(send(session_id, Reply::StopWaiting));
            }
        }
        actions
    }

    /// One `KeyUpdate` per watcher, in subscription order.
    fn notify_watchers(&self, key: &str, old: Bytes, new: Bytes) -> Vec<StoreAction> {
        let Some(watchers) = self.watchers.get(key) else {
            return Vec::new();
        };

        watchers
            .iter()
            .map(|&session_id| {
                send(
                    session_id,
                    Reply::KeyUpdate(KeyUpdate {
                        key: key.to_string(),
                        old: old.clone(),
                        new: new.clone(),
                    }),
                )
            })
            .collect()
    }

    /// Remove every trace of a session from the indices.
    ///
    /// Value-wise removal: entries whose vectors empty out are dropped from
    /// their maps. Idempotent.
    fn purge(&mut self, session_id: SessionId) {
        self.sessions.remove(&session_id);
        self.awaited.remove(&session_id);
        self.waiting.retain(|_, waiters| {
            waiters.retain(|&s| s != session_id);
            !waiters.is_empty()
        });
        self.watchers.retain(|_, watchers| {
            watchers.retain(|&s| s != session_id);
            !watchers.is_empty()
        });
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of keys in the store.
    pub fn num_keys(&self) -> usize {
        self.store.len()
    }

    /// Sessions currently blocked on `key`, in registration order.
    pub fn waiters_on<'a>(&'a self, key: &str) -> impl Iterator<Item = SessionId> + 'a {
        self.waiting.get(key).into_iter().flatten().copied()
    }

    /// Sessions subscribed to change events for `key`, in subscription
    /// order.
    pub fn watchers_on<'a>(&'a self, key: &str) -> impl Iterator<Item = SessionId> + 'a {
        self.watchers.get(key).into_iter().flatten().copied()
    }

    /// Remaining missing-key count for a blocked session, if any.
    pub fn pending_wait(&self, session_id: SessionId) -> Option<usize> {
        self.awaited.get(&session_id).copied()
    }
}

fn parse_decimal(key: &str, value: &Bytes) -> Result<i64, DriverError> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| DriverError::NonDecimalValue { key: key.to_string() })
}

impl std::fmt::Debug for StoreDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreDriver")
            .field("session_count", &self.sessions.len())
            .field("num_keys", &self.store.len())
            .field("pending_waits", &self.awaited.len())
            .finish()
    }
}
