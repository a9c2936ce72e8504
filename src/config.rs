use std::time::Duration;

/// Coordinates for a broker connection. Immutable once built; owned by the
/// caller and handed to [`crate::connection::ConnectionManager::get_instance`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub reconnect: bool,
    pub reconnect_interval: Duration,
    /// `None` means retry forever, matching spec.md's "0/absent = infinite".
    pub max_reconnect_attempts: Option<u32>,
    pub heartbeat: u16,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: true,
            reconnect_interval: Duration::from_millis(500),
            max_reconnect_attempts: None,
            heartbeat: 60,
        }
    }

    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.reconnect = enabled;
        self
    }

    pub fn reconnect_interval(mut self, d: Duration) -> Self {
        self.reconnect_interval = d;
        self
    }

    pub fn max_reconnect_attempts(mut self, n: u32) -> Self {
        self.max_reconnect_attempts = Some(n);
        self
    }

    pub fn heartbeat(mut self, secs: u16) -> Self {
        self.heartbeat = secs;
        self
    }
}

/// Bounds and timers governing a [`crate::pool::ChannelPool`].
#[derive(Debug, Clone)]
pub struct ChannelPoolConfig {
    pub min: usize,
    pub max: usize,
    pub acquire_timeout: Duration,
    pub eviction_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for ChannelPoolConfig {
    fn default() -> Self {
        Self {
            min: 1,
            max: 10,
            acquire_timeout: Duration::from_secs(5),
            eviction_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Options recognized by [`crate::rpc::client::RpcClient::new`].
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub queue_name: String,
    pub timeout: Duration,
    pub assert_queue: bool,
}

impl RpcClientConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            timeout: Duration::from_secs(30),
            assert_queue: true,
        }
    }
}

/// Options recognized by [`crate::rpc::server::RpcServer::new`].
#[derive(Debug, Clone)]
pub struct RpcServerConfig {
    pub queue_name: String,
    pub prefetch: u16,
    pub assert_queue: bool,
}

impl RpcServerConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            prefetch: 20,
            assert_queue: true,
        }
    }
}

/// Options recognized by [`crate::pubsub::publisher::Publisher::new`].
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub exchange: String,
    pub exchange_type: lapin::ExchangeKind,
    pub default_routing_key: Option<String>,
    pub persistent: bool,
    /// Upper bound on unconfirmed in-flight publishes; see DESIGN.md OQ-2
    /// for why this stands in for amqplib's `drain` backpressure event.
    pub max_in_flight_confirms: usize,
}

impl PublisherConfig {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            exchange_type: lapin::ExchangeKind::Topic,
            default_routing_key: None,
            persistent: true,
            max_in_flight_confirms: 64,
        }
    }
}

/// Options recognized by [`crate::pubsub::subscriber::Subscriber::new`].
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub exchange: String,
    pub exchange_type: lapin::ExchangeKind,
    pub queue_name: String,
    pub prefetch: u16,
}

impl SubscriberConfig {
    pub fn new(exchange: impl Into<String>, queue_name: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            exchange_type: lapin::ExchangeKind::Topic,
            queue_name: queue_name.into(),
            prefetch: 20,
        }
    }
}
