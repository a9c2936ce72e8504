//! RPC client, spec.md §4.3. Sends a [`crate::envelope::RequestEnvelope`] to
//! a server queue and correlates the reply off the broker's direct
//! reply-to pseudo-queue (`amq.rabbitmq.reply-to`), the same "no durable
//! reply queue per client" shortcut amqplib's RPC helpers use. Grounded on
//! the teacher's `subscriber.rs` for the consume/ack-mode shape and on
//! `subscriber.rs::process_messages`'s `for_each_concurrent` dispatch loop
//! for how deliveries are fanned out to the right waiter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::config::RpcClientConfig;
use crate::connection::ConnectionManager;
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::{Error, Result};
use crate::serializer::{JsonSerializer, Serializer};

const REPLY_TO: &str = "amq.rabbitmq.reply-to";

/// Per-call overrides for [`RpcClient::send`].
#[derive(Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
    pub metadata: Option<Value>,
}

struct Pending {
    reply_tx: oneshot::Sender<ResponseEnvelope>,
}

/// One client instance owns one channel and one reply-to consumer; both are
/// long-lived for the client's lifetime, matching spec.md §4.3 ("a single
/// channel per client instance").
pub struct RpcClient {
    channel: Channel,
    config: RpcClientConfig,
    pending: Mutex<HashMap<String, Pending>>,
    serializer: JsonSerializer,
    closing: AtomicBool,
}

impl RpcClient {
    pub async fn new(connection_manager: Arc<ConnectionManager>, config: RpcClientConfig) -> Result<Arc<Self>> {
        let conn = connection_manager.get_connection().await?;
        let channel = conn.create_channel().await?;
        connection_manager.note_channel_opened();

        if config.assert_queue {
            channel
                .queue_declare(&config.queue_name, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
                .await?;
        }

        let consumer = channel
            .basic_consume(
                REPLY_TO,
                &format!("rpc-client-{}", Uuid::new_v4()),
                BasicConsumeOptions { no_ack: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;

        let client = Arc::new(Self {
            channel,
            config,
            pending: Mutex::new(HashMap::new()),
            serializer: JsonSerializer,
            closing: AtomicBool::new(false),
        });
        client.clone().spawn_reply_listener(consumer);
        Ok(client)
    }

    fn spawn_reply_listener(self: Arc<Self>, mut consumer: lapin::Consumer) {
        tokio::spawn(async move {
            while let Some(delivery_res) = consumer.next().await {
                let delivery = match delivery_res {
                    Ok(d) => d,
                    Err(e) => {
                        log::error!("rpc client: reply delivery error: {}", e);
                        continue;
                    }
                };
                let envelope: ResponseEnvelope = match self.serializer.decode(&delivery.data) {
                    Ok(e) => e,
                    Err(e) => {
                        log::error!("rpc client: failed to decode reply: {}", e);
                        if let Some(cid) = delivery.properties.correlation_id() {
                            let mut pending = self.pending.lock().await;
                            if let Some(waiter) = pending.remove(cid.as_str()) {
                                let _ = waiter.reply_tx.send(ResponseEnvelope::err(cid.as_str(), &Error::Decode(e.to_string())));
                            }
                        }
                        continue;
                    }
                };
                let mut pending = self.pending.lock().await;
                if let Some(waiter) = pending.remove(&envelope.id) {
                    let _ = waiter.reply_tx.send(envelope);
                } else {
                    log::warn!("rpc client: reply for unknown or already-resolved id {}", envelope.id);
                }
            }
        });
    }

    /// Sends `command`/`data` to the server queue and awaits the correlated
    /// reply, honoring `opts.timeout` (default [`RpcClientConfig::timeout`])
    /// and `opts.cancellation`.
    pub async fn send(&self, command: &str, data: Value, opts: RequestOptions) -> Result<Value> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::ClientClosing);
        }
        if command.trim().is_empty() {
            return Err(Error::Validation("command must not be empty".into()));
        }

        let started_at = std::time::Instant::now();
        let id = Uuid::new_v4().to_string();
        let envelope = RequestEnvelope::new(id.clone(), command, data, opts.metadata);
        let bytes = self.serializer.encode(&envelope)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), Pending { reply_tx: tx });

        let properties = BasicProperties::default()
            .with_reply_to(REPLY_TO.into())
            .with_correlation_id(id.clone().into())
            .with_content_type("application/json".into());

        if let Err(e) = self
            .channel
            .basic_publish(
                "",
                &self.config.queue_name,
                BasicPublishOptions::default(),
                &bytes,
                properties,
            )
            .await
        {
            self.pending.lock().await.remove(&id);
            return Err(Error::from(e));
        }

        let timeout = opts.timeout.unwrap_or(self.config.timeout);
        let cancellation = opts.cancellation.unwrap_or_default();

        let response = tokio::select! {
            result = rx => {
                result.map_err(|_| Error::Channel("reply channel dropped".into()))?
            }
            _ = tokio::time::sleep(timeout) => {
                self.pending.lock().await.remove(&id);
                return Err(Error::Timeout);
            }
            _ = cancellation.cancelled() => {
                self.pending.lock().await.remove(&id);
                return Err(Error::Cancelled);
            }
        };

        crate::metrics::global().observe_histogram(
            "rpc_client_request_duration_seconds",
            "RPC client request round-trip duration in seconds",
            crate::metrics::labels([("command", envelope.command.clone())]),
            started_at.elapsed().as_secs_f64(),
        );

        if response.success {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            let error = response.error.unwrap_or(crate::envelope::ResponseError {
                code: "UNKNOWN_ERROR".into(),
                message: "server reported failure with no error payload".into(),
                details: None,
                stack: None,
            });
            Err(Error::Custom { code: error.code, message: error.message, details: error.details })
        }
    }

    /// Idempotent. Rejects any still-pending calls with [`Error::ClientClosing`].
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut pending = self.pending.lock().await;
        for (_, waiter) in pending.drain() {
            let _ = waiter.reply_tx.send(ResponseEnvelope::err("", &Error::ClientClosing));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_options_default_has_no_overrides() {
        let opts = RequestOptions::default();
        assert!(opts.timeout.is_none());
        assert!(opts.cancellation.is_none());
    }
}
