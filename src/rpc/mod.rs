//! Request/response over AMQP, spec.md §4.3 and §4.4.

pub mod client;
pub mod server;

pub use client::{RequestOptions, RpcClient};
pub use server::RpcServer;
