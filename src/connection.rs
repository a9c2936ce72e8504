//! Connection lifecycle manager, spec.md §4.1. Owns the single broker
//! [`lapin::Connection`] for a URL, survives network failures with capped
//! exponential backoff, and reports channel usage and lifecycle events.
//!
//! Reconnection is grounded on
//! `examples/other_examples/223d5a05_strut-rs-strut__strut_rabbitmq-src-connector.rs.rs`:
//! a background task owns the connection, callers await a fresh handle, and
//! failures are retried with backoff rather than surfaced per-caller. The
//! teacher's own `timeout(Duration::from_secs(60), Connection::connect(..))`
//! pattern in `subscriber.rs` is reused for the initial connect attempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lapin::{Connection, ConnectionProperties};
use once_cell::sync::Lazy;
use tokio::sync::{broadcast, Mutex as AsyncMutex, Notify};

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Error(String),
    Reconnecting { attempt: u32 },
}

#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub url: String,
}

struct State {
    connection: Option<Connection>,
    connected_at: Option<DateTime<Utc>>,
    closing: bool,
}

/// Process-wide instance per URL, per spec.md §4.1 ("getInstance(config)
/// returns the process-wide instance for the given URL"). `once_cell` gives
/// the same lazily-initialized package-scope helper spec.md §9 recommends
/// ("offer a lazily initialized package-scope helper only as a
/// convenience"), grounded on `mongodb-mongo-rust-driver`'s dependency on
/// `once_cell`.
static REGISTRY: Lazy<StdMutex<HashMap<String, Arc<ConnectionManager>>>> = Lazy::new(|| StdMutex::new(HashMap::new()));

pub struct ConnectionManager {
    config: ConnectionConfig,
    state: AsyncMutex<State>,
    connect_gate: AsyncMutex<()>,
    channel_count: AtomicUsize,
    reconnect_attempt: AtomicU32,
    background_started: std::sync::atomic::AtomicBool,
    notify: Notify,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    /// Returns the process-wide instance for `config.url`, creating it on
    /// first use.
    pub fn get_instance(config: ConnectionConfig) -> Arc<ConnectionManager> {
        let mut registry = REGISTRY.lock().unwrap();
        registry
            .entry(config.url.clone())
            .or_insert_with(|| Arc::new(ConnectionManager::new(config)))
            .clone()
    }

    fn new(config: ConnectionConfig) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            config,
            state: AsyncMutex::new(State {
                connection: None,
                connected_at: None,
                closing: false,
            }),
            connect_gate: AsyncMutex::new(()),
            channel_count: AtomicUsize::new(0),
            reconnect_attempt: AtomicU32::new(0),
            background_started: std::sync::atomic::AtomicBool::new(false),
            notify: Notify::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    /// Returns the current connection, opening one if needed. Concurrent
    /// callers observe a single in-flight open via `connect_gate`.
    pub async fn get_connection(self: &Arc<Self>) -> Result<Connection> {
        {
            let state = self.state.lock().await;
            if let Some(conn) = &state.connection {
                return Ok(conn.clone());
            }
        }

        let _gate = self.connect_gate.lock().await;
        // Re-check: another caller may have finished connecting while we waited on the gate.
        {
            let state = self.state.lock().await;
            if let Some(conn) = &state.connection {
                return Ok(conn.clone());
            }
        }

        if self.config.reconnect {
            self.connect_with_backoff().await
        } else {
            // "the first failure is surfaced to the caller" per spec.md §4.1.
            self.try_connect_once().await
        }
    }

    async fn try_connect_once(self: &Arc<Self>) -> Result<Connection> {
        match open_connection(&self.config).await {
            Ok(conn) => {
                self.store_connected(conn.clone()).await;
                self.spawn_close_watcher(conn.clone());
                self.emit(ConnectionEvent::Connected);
                Ok(conn)
            }
            Err(e) => {
                self.emit(ConnectionEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn connect_with_backoff(self: &Arc<Self>) -> Result<Connection> {
        let mut attempt: u32 = 0;
        let mut delay = self.config.reconnect_interval;
        const MAX_DELAY: Duration = Duration::from_secs(60);

        loop {
            match open_connection(&self.config).await {
                Ok(conn) => {
                    self.reconnect_attempt.store(0, Ordering::SeqCst);
                    self.store_connected(conn.clone()).await;
                    self.spawn_close_watcher(conn.clone());
                    self.emit(ConnectionEvent::Connected);
                    return Ok(conn);
                }
                Err(e) => {
                    attempt += 1;
                    if let Some(max) = self.config.max_reconnect_attempts {
                        if attempt >= max {
                            self.emit(ConnectionEvent::Error(e.to_string()));
                            return Err(e);
                        }
                    }
                    self.reconnect_attempt.store(attempt, Ordering::SeqCst);
                    self.emit(ConnectionEvent::Reconnecting { attempt });
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_DELAY);
                }
            }
        }
    }

    async fn store_connected(&self, conn: Connection) {
        let mut state = self.state.lock().await;
        state.connection = Some(conn);
        state.connected_at = Some(Utc::now());
        self.notify.notify_waiters();
    }

    /// Watches the connection for a broker-initiated close and, unless
    /// `close()` was called, clears the cached handle so the next
    /// `get_connection()` call reconnects. Grounded on the connector pattern
    /// in `strut-rs-strut`'s `Connector`, which discards bad connections and
    /// lets the next request re-establish one.
    fn spawn_close_watcher(self: &Arc<Self>, conn: Connection) {
        let manager = self.clone();
        let (tx, rx) = tokio::sync::oneshot::channel::<lapin::Error>();
        let tx = StdMutex::new(Some(tx));
        conn.on_error(move |err| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(err);
            }
        });
        tokio::spawn(async move {
            if let Ok(err) = rx.await {
                manager.report_error(&err).await;
            }
        });
    }

    /// Called by collaborators (e.g. [`crate::pool::ChannelPool`]) when a
    /// broker operation reveals the connection is no longer usable.
    pub async fn report_error(self: &Arc<Self>, err: &lapin::Error) {
        let mut state = self.state.lock().await;
        if state.closing {
            return;
        }
        state.connection = None;
        state.connected_at = None;
        drop(state);
        self.emit(ConnectionEvent::Disconnected);
        log::warn!("connection: broker reported an error, will reconnect on next use: {}", err);
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connection.is_some()
    }

    pub async fn get_connection_status(&self) -> ConnectionStatus {
        let state = self.state.lock().await;
        ConnectionStatus {
            connected: state.connection.is_some(),
            connected_at: state.connected_at,
            url: self.config.url.clone(),
        }
    }

    pub fn get_channel_count(&self) -> usize {
        self.channel_count.load(Ordering::SeqCst)
    }

    pub fn note_channel_opened(&self) {
        self.channel_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn note_channel_closed(&self) {
        self.channel_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Idempotent: tears down the connection and cancels reconnection.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.closing {
            return;
        }
        state.closing = true;
        if let Some(conn) = state.connection.take() {
            let _ = conn.close(200, "closed by ConnectionManager").await;
        }
        state.connected_at = None;
        drop(state);
        self.emit(ConnectionEvent::Disconnected);
    }
}

async fn open_connection(config: &ConnectionConfig) -> Result<Connection> {
    let props = ConnectionProperties::default()
        .with_connection_name(config.url.clone().into())
        .with_heartbeat(config.heartbeat);
    let connect = Connection::connect(&config.url, props);
    tokio::time::timeout(Duration::from_secs(60), connect)
        .await
        .map_err(|_| Error::Connection("connection attempt timed out".into()))?
        .map_err(|e| Error::Connection(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_instance_is_a_singleton_per_url() {
        let a = ConnectionManager::get_instance(ConnectionConfig::new("amqp://one"));
        let b = ConnectionManager::get_instance(ConnectionConfig::new("amqp://one"));
        assert!(Arc::ptr_eq(&a, &b));

        let c = ConnectionManager::get_instance(ConnectionConfig::new("amqp://two"));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn channel_count_tracks_open_and_close() {
        let manager = ConnectionManager::new(ConnectionConfig::new("amqp://count-test"));
        manager.note_channel_opened();
        manager.note_channel_opened();
        manager.note_channel_closed();
        assert_eq!(manager.get_channel_count(), 1);
    }
}
