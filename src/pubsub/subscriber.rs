//! Topic-exchange subscriber, spec.md §4.6. One queue, bound to the exchange
//! once per registered pattern; a delivery's routing key is matched against
//! every registered pattern via [`crate::topic::matches`], and every
//! matching handler runs before the delivery is acknowledged. A handler
//! error nacks the delivery without requeue, since a bad subscriber handler
//! re-delivering the same message in a tight loop is worse than dropping it
//! (dead-letter it at the queue if that's needed). Dispatch loop grounded on
//! `subscriber.rs::process_messages`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::Channel;
use tokio::sync::{Mutex, Notify};

use crate::config::SubscriberConfig;
use crate::connection::ConnectionManager;
use crate::envelope::EventEnvelope;
use crate::error::Result;
use crate::middleware::{Composed, Context, Handler, Middleware};
use crate::serializer::{JsonSerializer, Serializer};
use crate::topic;

const DRAIN_GRACE: Duration = Duration::from_secs(5);

struct Binding {
    pattern: String,
    middlewares: Vec<Arc<dyn Middleware>>,
    handler: Arc<dyn Handler>,
}

pub struct Subscriber {
    channel: Channel,
    config: SubscriberConfig,
    bindings: Mutex<Vec<Binding>>,
    serializer: JsonSerializer,
    running: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Subscriber {
    pub async fn new(connection_manager: Arc<ConnectionManager>, config: SubscriberConfig) -> Result<Arc<Self>> {
        let conn = connection_manager.get_connection().await?;
        let channel = conn.create_channel().await?;
        connection_manager.note_channel_opened();

        channel
            .exchange_declare(
                &config.exchange,
                config.exchange_type.clone(),
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_declare(&config.queue_name, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
            .await?;
        channel.basic_qos(config.prefetch, BasicQosOptions::default()).await?;

        Ok(Arc::new(Self {
            channel,
            config,
            bindings: Mutex::new(Vec::new()),
            serializer: JsonSerializer,
            running: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }))
    }

    /// Binds the queue to `pattern` and registers the middleware chain and
    /// handler to run for matching deliveries.
    pub async fn on(&self, pattern: &str, middlewares: Vec<Arc<dyn Middleware>>, handler: Arc<dyn Handler>) -> Result<()> {
        self.channel
            .queue_bind(&self.config.queue_name, &self.config.exchange, pattern, QueueBindOptions::default(), FieldTable::default())
            .await?;
        self.bindings.lock().await.push(Binding {
            pattern: pattern.to_string(),
            middlewares,
            handler,
        });
        Ok(())
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let consumer = self
            .channel
            .basic_consume(
                &self.config.queue_name,
                "subscriber",
                BasicConsumeOptions { no_ack: false, ..Default::default() },
                FieldTable::default(),
            )
            .await?;

        let subscriber = self.clone();
        tokio::spawn(async move {
            let mut consumer = consumer;
            while let Some(delivery_res) = consumer.next().await {
                if !subscriber.running.load(Ordering::SeqCst) {
                    break;
                }
                let delivery = match delivery_res {
                    Ok(d) => d,
                    Err(e) => {
                        log::error!("subscriber: delivery error: {}", e);
                        continue;
                    }
                };
                let subscriber = subscriber.clone();
                subscriber.in_flight.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    subscriber.handle_delivery(delivery).await;
                    if subscriber.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                        subscriber.idle.notify_waiters();
                    }
                });
            }
        });

        Ok(())
    }

    async fn handle_delivery(&self, delivery: lapin::message::Delivery) {
        let delivery_tag = delivery.delivery_tag;
        let routing_key = delivery.routing_key.to_string();

        let envelope: EventEnvelope = match self.serializer.decode(&delivery.data) {
            Ok(e) => e,
            Err(e) => {
                log::error!("subscriber: failed to decode event on routing key {}: {}", routing_key, e);
                let _ = self
                    .channel
                    .basic_nack(delivery_tag, BasicNackOptions { multiple: false, requeue: false })
                    .await;
                return;
            }
        };

        let matching: Vec<(Vec<Arc<dyn Middleware>>, Arc<dyn Handler>)> = {
            let bindings = self.bindings.lock().await;
            bindings
                .iter()
                .filter(|b| topic::matches(&b.pattern, &routing_key))
                .map(|b| (b.middlewares.clone(), b.handler.clone()))
                .collect()
        };

        if matching.is_empty() {
            log::warn!("subscriber: no binding matched routing key {}", routing_key);
            let _ = self.channel.basic_ack(delivery_tag, BasicAckOptions::default()).await;
            return;
        }

        let mut failed = false;
        for (middlewares, handler) in matching {
            let composed = Composed::new(middlewares, handler);
            if let Err(e) = composed.run(envelope.data.clone(), Context::new()).await {
                log::error!("subscriber: handler for routing key {} failed: {}", routing_key, e);
                failed = true;
            }
        }

        if failed {
            let _ = self
                .channel
                .basic_nack(delivery_tag, BasicNackOptions { multiple: false, requeue: false })
                .await;
        } else {
            let _ = self.channel.basic_ack(delivery_tag, BasicAckOptions::default()).await;
        }
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.channel.basic_cancel("subscriber", BasicCancelOptions::default()).await;
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            let wait = self.idle.notified();
            let _ = tokio::time::timeout(DRAIN_GRACE, wait).await;
        }
    }
}
