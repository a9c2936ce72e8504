//! Middleware composition model shared by `RpcServer`, `Publisher`, and
//! `Subscriber`, per spec.md §4.7.
//!
//! `next` is represented as an owned [`Next`] value rather than a borrowed
//! callback: since [`Context`] is cheaply `Clone` (it wraps an `Arc`), the
//! whole chain is threaded by value, sidestepping the lifetime gymnastics a
//! borrowed-callback design would need. A middleware that drops `next`
//! instead of calling `next.run(..)` short-circuits the chain, matching
//! spec.md §9's "have `next` return an optional outcome and treat missing
//! invocation as 'drop'".

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::cancel::CancellationToken;
use crate::error::{Error, Result};

/// Shared, mutable per-delivery context threaded through a middleware chain.
#[derive(Clone)]
pub struct Context {
    pub cancellation: CancellationToken,
    state: Arc<Mutex<HashMap<String, Value>>>,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.state.lock().unwrap().insert(key.into(), value);
    }
}

/// A middleware step: pre-`next` work runs before calling `next.run(..)`,
/// post-`next` work runs after it returns, matching the lexical ordering
/// invariant in spec.md §4.7.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn call(&self, message: Value, ctx: Context, next: Next) -> Result<Option<Value>>;
}

/// The terminal function in a composed chain; never receives `next`.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, message: Value, ctx: Context) -> Result<Value>;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The remainder of a composed chain, handed to the current middleware.
/// Calling [`Next::run`] invokes the next middleware (or the terminal
/// handler once the chain is exhausted); never calling it drops the
/// delivery silently, per spec.md §4.7.
#[derive(Clone)]
pub struct Next {
    middlewares: Arc<Vec<Arc<dyn Middleware>>>,
    handler: Arc<dyn Handler>,
    idx: usize,
}

impl Next {
    pub fn run(self, message: Value, ctx: Context) -> BoxFuture<'static, Result<Option<Value>>> {
        Box::pin(async move {
            if self.idx >= self.middlewares.len() {
                return self.handler.call(message, ctx).await.map(Some);
            }
            let mw = self.middlewares[self.idx].clone();
            let next = Next {
                middlewares: self.middlewares.clone(),
                handler: self.handler.clone(),
                idx: self.idx + 1,
            };
            mw.call(message, ctx, next).await
        })
    }
}

/// A composed handler chain: `compose(middlewares, handler)` in spec.md
/// §4.7. The terminal handler being a distinct, statically required argument
/// is how this port enforces "the last argument must be a handler": a
/// misconfiguration that a dynamically typed chain would only catch at
/// call time here fails to compile instead (see DESIGN.md, OQ-3).
pub struct Composed {
    chain: Next,
}

impl Composed {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>, handler: Arc<dyn Handler>) -> Self {
        Self {
            chain: Next {
                middlewares: Arc::new(middlewares),
                handler,
                idx: 0,
            },
        }
    }

    /// Invokes the composed chain. Returns `Ok(None)` if some middleware
    /// short-circuited; an async exception anywhere in the chain propagates
    /// as `Err`, per spec.md §4.7.
    pub async fn run(&self, message: Value, ctx: Context) -> Result<Option<Value>> {
        self.chain.clone().run(message, ctx).await
    }
}

/// Adapts a plain async closure into a [`Middleware`], for callers who don't
/// want to name a struct for every step.
pub struct FnMiddleware<F>(F);

impl<F> FnMiddleware<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(Value, Context, Next) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Value>>> + Send,
{
    async fn call(&self, message: Value, ctx: Context, next: Next) -> Result<Option<Value>> {
        (self.0)(message, ctx, next).await
    }
}

pub struct FnHandler<F>(F);

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Value, Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn call(&self, message: Value, ctx: Context) -> Result<Value> {
        (self.0)(message, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handler_echo() -> Arc<dyn Handler> {
        Arc::new(FnHandler::new(|message: Value, _ctx: Context| async move { Ok(message) }))
    }

    #[tokio::test]
    async fn executes_lexically_pre_and_post_next() {
        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let o1 = order.clone();
        let o2 = order.clone();

        let mw_a = Arc::new(FnMiddleware::new(move |m, ctx, next: Next| {
            let o1 = o1.clone();
            async move {
                o1.lock().unwrap().push("a-pre");
                let result = next.run(m, ctx).await;
                o1.lock().unwrap().push("a-post");
                result
            }
        })) as Arc<dyn Middleware>;

        let mw_b = Arc::new(FnMiddleware::new(move |m, ctx, next: Next| {
            let o2 = o2.clone();
            async move {
                o2.lock().unwrap().push("b-pre");
                let result = next.run(m, ctx).await;
                o2.lock().unwrap().push("b-post");
                result
            }
        })) as Arc<dyn Middleware>;

        let composed = Composed::new(vec![mw_a, mw_b], handler_echo());
        composed.run(json!({"x": 1}), Context::new()).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["a-pre", "b-pre", "b-post", "a-post"]);
    }

    #[tokio::test]
    async fn next_overrides_message_for_downstream() {
        let mw = Arc::new(FnMiddleware::new(|_m, ctx, next: Next| async move {
            next.run(json!({"overridden": true}), ctx).await
        })) as Arc<dyn Middleware>;

        let handler = Arc::new(FnHandler::new(|message: Value, _ctx| async move { Ok(message) }));
        let composed = Composed::new(vec![mw], handler);
        let result = composed.run(json!({"overridden": false}), Context::new()).await.unwrap();
        assert_eq!(result, Some(json!({"overridden": true})));
    }

    #[tokio::test]
    async fn short_circuit_drops_handler() {
        let called = Arc::new(AtomicUsize::new(0));
        let called2 = called.clone();
        let mw = Arc::new(FnMiddleware::new(move |_m, _ctx, _next: Next| {
            let called = called2.clone();
            async move {
                called.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        })) as Arc<dyn Middleware>;

        let handler = Arc::new(FnHandler::new(|message, _ctx| async move { Ok(message) }));
        let composed = Composed::new(vec![mw], handler);
        let result = composed.run(json!({}), Context::new()).await.unwrap();
        assert_eq!(result, None);
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_propagates_to_caller() {
        let mw = Arc::new(FnMiddleware::new(|_m, _ctx, _next: Next| async move {
            Err(Error::custom("BOOM", "kaboom"))
        })) as Arc<dyn Middleware>;

        let composed = Composed::new(vec![mw], handler_echo());
        let err = composed.run(json!({}), Context::new()).await.unwrap_err();
        assert_eq!(err.code(), "BOOM");
    }
}
