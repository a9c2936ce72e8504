//! Async AMQP 0-9-1 client library layering RPC request/response and
//! topic-exchange publish/subscribe on top of [`lapin`], with connection
//! lifecycle management, channel pooling, retries, and middleware shared
//! across both styles of messaging.

pub mod cancel;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod pool;
pub mod pubsub;
pub mod retry;
pub mod rpc;
pub mod serializer;
pub mod topic;
pub mod xdeath;

pub use config::{ChannelPoolConfig, ConnectionConfig, PublisherConfig, RpcClientConfig, RpcServerConfig, SubscriberConfig};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionStatus};
pub use envelope::{EventEnvelope, RequestEnvelope, ResponseEnvelope, ResponseError};
pub use error::{Error, Result};
pub use middleware::{Composed, Context, FnHandler, FnMiddleware, Handler, Middleware, Next};
pub use pool::{ChannelPool, LapinChannelFactory, ResourceFactory};
pub use pubsub::{Publisher, PublishOptions, Subscriber};
pub use retry::RetryPolicy;
pub use rpc::{RequestOptions, RpcClient, RpcServer};
pub use serializer::{JsonSerializer, Serializer};
