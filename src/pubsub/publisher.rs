//! Topic-exchange publisher, spec.md §4.5. Publishes go through a
//! confirm-select channel pulled from a [`ChannelPool`], so a broken channel
//! is recycled rather than wedging the publisher. In-flight confirms are
//! capped with a semaphore standing in for amqplib's `drain` backpressure
//! event (see DESIGN.md, OQ-2). Grounded on `report-tags/src/rabbitmq/publisher.rs`
//! for the thin wrapper shape (`new(exchange, routing_key)` / `publish` /
//! `close` / `is_connected`), generalized to per-publish routing keys and
//! middleware.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::BasicProperties;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};

use crate::config::{ChannelPoolConfig, PublisherConfig};
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::envelope::EventEnvelope;
use crate::error::{Error, Result};
use crate::middleware::{Composed, Context, Handler, Middleware};
use crate::pool::{ChannelPool, LapinChannelFactory, PooledResource};
use crate::serializer::{JsonSerializer, Serializer};

/// Per-call overrides for [`Publisher::publish`].
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    pub persistent: Option<bool>,
    pub metadata: Option<Value>,
}

struct PublishHandler {
    pool: Arc<ChannelPool<LapinChannelFactory>>,
    exchange: String,
    exchange_type: lapin::ExchangeKind,
    event_name: String,
    routing_key: String,
    persistent: bool,
    metadata: Option<Value>,
    serializer: JsonSerializer,
    exchange_asserted: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl Handler for PublishHandler {
    async fn call(&self, message: Value, _ctx: Context) -> Result<Value> {
        let pooled: PooledResource<lapin::Channel> = self.pool.acquire().await?;

        if !self.exchange_asserted.lock().await.contains(&self.exchange) {
            pooled
                .resource
                .exchange_declare(
                    &self.exchange,
                    self.exchange_type.clone(),
                    ExchangeDeclareOptions { durable: true, ..Default::default() },
                    FieldTable::default(),
                )
                .await?;
            self.exchange_asserted.lock().await.insert(self.exchange.clone());
        }

        let envelope = EventEnvelope::new(self.event_name.clone(), message, self.metadata.clone());
        let bytes = self.serializer.encode(&envelope)?;
        let mut properties = BasicProperties::default().with_content_type("application/json".into());
        if self.persistent {
            properties = properties.with_delivery_mode(2);
        }

        let publish_result = pooled
            .resource
            .basic_publish(&self.exchange, &self.routing_key, BasicPublishOptions::default(), &bytes, properties)
            .await;

        match publish_result {
            Ok(confirm) => match confirm.await {
                Ok(_) => {
                    self.pool.release(pooled).await;
                    Ok(Value::Null)
                }
                Err(e) => {
                    self.pool.destroy(pooled).await;
                    Err(e.into())
                }
            },
            Err(e) => {
                self.pool.destroy(pooled).await;
                Err(e.into())
            }
        }
    }
}

pub struct Publisher {
    pool: Arc<ChannelPool<LapinChannelFactory>>,
    config: PublisherConfig,
    middlewares: Mutex<Vec<Arc<dyn Middleware>>>,
    confirms: Semaphore,
    exchange_asserted: Arc<Mutex<HashSet<String>>>,
}

impl Publisher {
    pub fn new(connection_manager: Arc<ConnectionManager>, config: PublisherConfig) -> Arc<Self> {
        let factory = LapinChannelFactory::new(connection_manager.clone(), true);
        let pool_config = ChannelPoolConfig::default();
        let pool = Arc::new(ChannelPool::new(factory, pool_config));
        let exchange_asserted = Arc::new(Mutex::new(HashSet::new()));
        let max_in_flight = config.max_in_flight_confirms;

        let publisher = Arc::new(Self {
            pool,
            config,
            middlewares: Mutex::new(Vec::new()),
            confirms: Semaphore::new(max_in_flight),
            exchange_asserted,
        });
        publisher.clone().spawn_reconnect_watcher(connection_manager);
        publisher.clone().spawn_eviction_sweep();
        publisher
    }

    /// Periodically sweeps the channel pool for idle resources past
    /// `ChannelPoolConfig::idle_timeout`, per spec.md §4.2. Holds only a
    /// weak reference to the pool so the sweep task doesn't keep a closed
    /// publisher's pool alive.
    fn spawn_eviction_sweep(self: Arc<Self>) {
        let pool = Arc::downgrade(&self.pool);
        let interval = self.pool.config().eviction_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.evict_idle().await;
            }
        });
    }

    /// Exchange assertion is invalidated whenever the underlying broker
    /// connection drops, since a fresh connection means a fresh broker-side
    /// state to (re-)establish.
    fn spawn_reconnect_watcher(self: Arc<Self>, connection_manager: Arc<ConnectionManager>) {
        let mut events = connection_manager.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if matches!(event, ConnectionEvent::Disconnected) {
                    self.exchange_asserted.lock().await.clear();
                }
            }
        });
    }

    /// Installs a middleware applied to every publish, ahead of any
    /// per-call middleware passed to [`Publisher::publish`].
    pub async fn r#use(&self, middleware: Arc<dyn Middleware>) {
        self.middlewares.lock().await.push(middleware);
    }

    /// Publishes `data` as event `event_name`, honoring `opts.exchange`
    /// (falling back to [`PublisherConfig::exchange`]), `opts.routing_key`
    /// (falling back to [`PublisherConfig::default_routing_key`], then
    /// `event_name` itself), and `opts.persistent`. A middleware that
    /// short-circuits (returns `Ok(None)`) drops the message before it
    /// reaches the broker.
    pub async fn publish(&self, event_name: &str, data: Value, opts: PublishOptions) -> Result<()> {
        if event_name.trim().is_empty() {
            return Err(Error::Validation("event_name must not be empty".into()));
        }

        let exchange = opts.exchange.unwrap_or_else(|| self.config.exchange.clone());
        let routing_key = opts
            .routing_key
            .or_else(|| self.config.default_routing_key.clone())
            .unwrap_or_else(|| event_name.to_string());
        let persistent = opts.persistent.unwrap_or(self.config.persistent);

        let _permit = self.confirms.acquire().await.expect("semaphore never closed");

        let handler: Arc<dyn Handler> = Arc::new(PublishHandler {
            pool: self.pool.clone(),
            exchange,
            exchange_type: self.config.exchange_type.clone(),
            event_name: event_name.to_string(),
            routing_key,
            persistent,
            metadata: opts.metadata,
            serializer: JsonSerializer,
            exchange_asserted: self.exchange_asserted.clone(),
        });

        let chain = self.middlewares.lock().await.clone();
        let composed = Composed::new(chain, handler);
        composed.run(data, Context::new()).await.map(|_| ())
    }

    /// Publishes the same event to each exchange in `exchanges`, overriding
    /// [`PublishOptions::exchange`] per iteration. Fails with the first
    /// encountered error if any exchange's publish fails.
    pub async fn publish_to_many(&self, exchanges: &[String], event_name: &str, data: Value, opts: Option<PublishOptions>) -> Result<()> {
        let base = opts.unwrap_or_default();
        for exchange in exchanges {
            let opts = PublishOptions {
                exchange: Some(exchange.clone()),
                routing_key: base.routing_key.clone(),
                persistent: base.persistent,
                metadata: base.metadata.clone(),
            };
            self.publish(event_name, data.clone(), opts).await?;
        }
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.pool.size().await > 0 || self.pool.available().await > 0
    }

    pub async fn close(&self) {
        self.pool.drain(Some(std::time::Duration::from_secs(5))).await;
    }
}
