//! RPC server, spec.md §4.4. Consumes a command queue, dispatches each
//! request through the registered middleware chain and handler, and always
//! acknowledges the delivery: errors are reported in the reply envelope,
//! never as a broker-level nack, since a malformed or failing RPC call is
//! never retryable by redelivery. Dispatch loop shape grounded on the
//! teacher's `subscriber.rs::process_messages` (`for_each_concurrent` with a
//! bounded worker count, drawn from `basic_qos`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};
use tokio::sync::{Mutex, Notify};

use crate::config::RpcServerConfig;
use crate::connection::ConnectionManager;
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::{Error, Result};
use crate::middleware::{Composed, Context, Handler, Middleware};
use crate::serializer::{JsonSerializer, Serializer};

const DRAIN_GRACE: Duration = Duration::from_secs(5);

struct Registration {
    middlewares: Vec<Arc<dyn Middleware>>,
    handler: Arc<dyn Handler>,
}

pub struct RpcServer {
    channel: Channel,
    config: RpcServerConfig,
    handlers: Mutex<HashMap<String, Registration>>,
    middlewares: Mutex<Vec<Arc<dyn Middleware>>>,
    serializer: JsonSerializer,
    running: AtomicBool,
    in_flight: std::sync::atomic::AtomicUsize,
    idle: Notify,
}

impl RpcServer {
    pub async fn new(connection_manager: Arc<ConnectionManager>, config: RpcServerConfig) -> Result<Arc<Self>> {
        let conn = connection_manager.get_connection().await?;
        let channel = conn.create_channel().await?;
        connection_manager.note_channel_opened();

        if config.assert_queue {
            channel
                .queue_declare(&config.queue_name, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
                .await?;
        }
        channel.basic_qos(config.prefetch, BasicQosOptions::default()).await?;

        Ok(Arc::new(Self {
            channel,
            config,
            handlers: Mutex::new(HashMap::new()),
            middlewares: Mutex::new(Vec::new()),
            serializer: JsonSerializer,
            running: AtomicBool::new(false),
            in_flight: std::sync::atomic::AtomicUsize::new(0),
            idle: Notify::new(),
        }))
    }

    /// Registers a handler for `command`, case-insensitively, with a
    /// per-command middleware chain that runs after the server-wide chain
    /// installed via [`RpcServer::use_middleware`] and ahead of the handler.
    /// Overwriting an existing registration is allowed but logged, per
    /// spec.md §4.4.
    pub async fn register_handler(&self, command: &str, middlewares: Vec<Arc<dyn Middleware>>, handler: Arc<dyn Handler>) {
        let key = command.to_uppercase();
        let mut handlers = self.handlers.lock().await;
        if handlers.insert(key.clone(), Registration { middlewares, handler }).is_some() {
            log::warn!("rpc server: handler for command {} was already registered, overwriting", key);
        }
    }

    pub async fn unregister_handler(&self, command: &str) {
        self.handlers.lock().await.remove(&command.to_uppercase());
    }

    /// Installs a middleware applied to every command, ahead of the
    /// per-command handler, in registration order.
    pub async fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middlewares.lock().await.push(middleware);
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let consumer = self
            .channel
            .basic_consume(
                &self.config.queue_name,
                "rpc-server",
                BasicConsumeOptions { no_ack: false, ..Default::default() },
                FieldTable::default(),
            )
            .await?;

        let server = self.clone();
        tokio::spawn(async move {
            let mut consumer = consumer;
            while let Some(delivery_res) = consumer.next().await {
                if !server.running.load(Ordering::SeqCst) {
                    break;
                }
                let delivery = match delivery_res {
                    Ok(d) => d,
                    Err(e) => {
                        log::error!("rpc server: delivery error: {}", e);
                        continue;
                    }
                };
                let server = server.clone();
                server.in_flight.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    server.handle_delivery(delivery).await;
                    if server.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                        server.idle.notify_waiters();
                    }
                });
            }
        });

        Ok(())
    }

    async fn handle_delivery(&self, delivery: lapin::message::Delivery) {
        let delivery_tag = delivery.delivery_tag;
        let reply_to = delivery.properties.reply_to().clone();
        let correlation_id = delivery.properties.correlation_id().clone();

        let envelope: RequestEnvelope = match self.serializer.decode(&delivery.data) {
            Ok(e) => e,
            Err(e) => {
                log::error!("rpc server: failed to decode request: {}", e);
                let response = ResponseEnvelope::err("", &Error::Validation(e.to_string()));
                self.reply(reply_to, correlation_id, &response).await;
                let _ = self.channel.basic_ack(delivery_tag, BasicAckOptions::default()).await;
                return;
            }
        };

        let response = self.dispatch(&envelope).await;
        self.reply(reply_to, correlation_id, &response).await;
        let _ = self.channel.basic_ack(delivery_tag, BasicAckOptions::default()).await;
    }

    async fn reply(&self, reply_to: Option<lapin::types::ShortString>, correlation_id: Option<lapin::types::ShortString>, response: &ResponseEnvelope) {
        let Some(reply_to) = reply_to else {
            return;
        };
        let bytes = match self.serializer.encode(response) {
            Ok(b) => b,
            Err(e) => {
                log::error!("rpc server: failed to encode response: {}", e);
                return;
            }
        };
        let mut props = BasicProperties::default();
        if let Some(cid) = correlation_id {
            props = props.with_correlation_id(cid);
        }
        if let Err(e) = self
            .channel
            .basic_publish("", reply_to.as_str(), BasicPublishOptions::default(), &bytes, props)
            .await
        {
            log::error!("rpc server: failed to publish reply: {}", e);
        }
    }

    async fn dispatch(&self, envelope: &RequestEnvelope) -> ResponseEnvelope {
        let command = envelope.command.to_uppercase();
        let registration = {
            let handlers = self.handlers.lock().await;
            handlers.get(&command).map(|r| (r.middlewares.clone(), r.handler.clone()))
        };
        let Some((per_command, handler)) = registration else {
            return ResponseEnvelope::err(&envelope.id, &Error::HandlerNotFound(command));
        };

        let mut middlewares = self.middlewares.lock().await.clone();
        middlewares.extend(per_command);
        let composed = Composed::new(middlewares, handler);
        match composed.run(envelope.data.clone(), Context::new()).await {
            Ok(Some(data)) => ResponseEnvelope::ok(&envelope.id, data),
            Ok(None) => ResponseEnvelope::ok(&envelope.id, serde_json::Value::Null),
            Err(e) => ResponseEnvelope::err(&envelope.id, &e),
        }
    }

    /// Stops consuming and waits (bounded by a 5s grace period) for in-flight
    /// deliveries to finish, per spec.md §4.4.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            let wait = self.idle.notified();
            let _ = tokio::time::timeout(DRAIN_GRACE, wait).await;
        }
    }
}
