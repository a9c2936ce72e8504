//! Bounded channel pool, spec.md §4.2. Generalized over a [`ResourceFactory`]
//! trait (create / health-check / close) the way
//! `examples/other_examples/13bf182a_NathanFlurry-bb8__src-lib.rs.rs` (bb8)
//! generalizes over `ManageConnection`: production code plugs in a factory
//! that opens confirm-mode `lapin::Channel`s on a shared
//! [`crate::connection::ConnectionManager`]; tests plug in an in-memory
//! fake so pool accounting is verifiable without a broker.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lapin::options::ConfirmSelectOptions;
use tokio::sync::{oneshot, Mutex, Notify};

use crate::config::ChannelPoolConfig;
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use std::sync::Arc;

#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + 'static;

    async fn create(&self) -> Result<Self::Resource>;

    /// A cheap broker round-trip (e.g. a passive queue check) confirming the
    /// resource is still usable.
    async fn health_check(&self, resource: &Self::Resource) -> bool;

    async fn close(&self, resource: Self::Resource);
}

/// A resource checked out of the pool. Carries an opaque id so
/// [`ChannelPool::release`]/[`ChannelPool::destroy`] can validate it came
/// from this pool, per spec.md §4.2 ("Unknown channel -> warn and no-op").
pub struct PooledResource<R> {
    pub id: u64,
    pub resource: R,
}

struct IdleEntry<R> {
    id: u64,
    resource: R,
    last_used_at: Instant,
}

struct Inner<R> {
    idle: VecDeque<IdleEntry<R>>,
    waiters: VecDeque<oneshot::Sender<Result<PooledResource<R>>>>,
    checked_out: HashSet<u64>,
    size: usize,
    draining: bool,
}

pub struct ChannelPool<F: ResourceFactory> {
    factory: F,
    config: ChannelPoolConfig,
    inner: Mutex<Inner<F::Resource>>,
    drain_notify: Notify,
    next_id: AtomicU64,
}

impl<F: ResourceFactory> ChannelPool<F> {
    pub fn new(factory: F, config: ChannelPoolConfig) -> Self {
        Self {
            factory,
            config,
            inner: Mutex::new(Inner {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                checked_out: HashSet::new(),
                size: 0,
                draining: false,
            }),
            drain_notify: Notify::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn config(&self) -> &ChannelPoolConfig {
        &self.config
    }

    pub async fn acquire(&self) -> Result<PooledResource<F::Resource>> {
        loop {
            let mut inner = self.inner.lock().await;
            if inner.draining {
                return Err(Error::PoolDraining);
            }

            if let Some(entry) = inner.idle.pop_front() {
                drop(inner);
                if self.factory.health_check(&entry.resource).await {
                    let mut inner = self.inner.lock().await;
                    inner.checked_out.insert(entry.id);
                    return Ok(PooledResource {
                        id: entry.id,
                        resource: entry.resource,
                    });
                }
                // Unhealthy: close it, drop from size, and try again.
                self.factory.close(entry.resource).await;
                let mut inner = self.inner.lock().await;
                inner.size = inner.size.saturating_sub(1);
                drop(inner);
                continue;
            }

            if inner.size < self.config.max {
                inner.size += 1;
                drop(inner);
                match self.factory.create().await {
                    Ok(resource) => {
                        let id = self.alloc_id();
                        let mut inner = self.inner.lock().await;
                        inner.checked_out.insert(id);
                        return Ok(PooledResource { id, resource });
                    }
                    Err(e) => {
                        let mut inner = self.inner.lock().await;
                        inner.size = inner.size.saturating_sub(1);
                        return Err(e);
                    }
                }
            }

            // Pool is saturated: enqueue a FIFO waiter with a deadline.
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(tx);
            drop(inner);

            match tokio::time::timeout(self.config.acquire_timeout, rx).await {
                Ok(Ok(result)) => return result,
                Ok(Err(_)) => return Err(Error::Channel("pool waiter dropped".into())),
                Err(_) => return Err(Error::AcquireTimeout(self.config.acquire_timeout)),
            }
        }
    }

    pub async fn release(&self, resource: PooledResource<F::Resource>) {
        let mut inner = self.inner.lock().await;
        if !inner.checked_out.remove(&resource.id) {
            log::warn!("pool: release() called with an unrecognized resource id {}", resource.id);
            return;
        }

        if let Some(waiter) = inner.waiters.pop_front() {
            inner.checked_out.insert(resource.id);
            drop(inner);
            // Hand the resource directly to the waiter without passing through the idle list.
            let _ = waiter.send(Ok(resource));
            return;
        }

        inner.idle.push_back(IdleEntry {
            id: resource.id,
            resource: resource.resource,
            last_used_at: Instant::now(),
        });
        self.maybe_signal_drain_done(&inner);
    }

    pub async fn destroy(&self, resource: PooledResource<F::Resource>) {
        {
            let mut inner = self.inner.lock().await;
            inner.checked_out.remove(&resource.id);
        }
        self.factory.close(resource.resource).await;

        let mut inner = self.inner.lock().await;
        inner.size = inner.size.saturating_sub(1);

        if let Some(waiter) = inner.waiters.pop_front() {
            if inner.size < self.config.max {
                inner.size += 1;
                drop(inner);
                match self.factory.create().await {
                    Ok(new_resource) => {
                        let id = self.alloc_id();
                        let mut inner = self.inner.lock().await;
                        inner.checked_out.insert(id);
                        let _ = waiter.send(Ok(PooledResource { id, resource: new_resource }));
                    }
                    Err(e) => {
                        let mut inner = self.inner.lock().await;
                        inner.size = inner.size.saturating_sub(1);
                        let _ = waiter.send(Err(e));
                    }
                }
                return;
            }
            inner.waiters.push_front(waiter);
        }
        self.maybe_signal_drain_done(&inner);
    }

    fn maybe_signal_drain_done(&self, inner: &Inner<F::Resource>) {
        if inner.draining && inner.checked_out.is_empty() {
            self.drain_notify.notify_waiters();
        }
    }

    pub async fn size(&self) -> usize {
        self.inner.lock().await.size
    }

    pub async fn available(&self) -> usize {
        self.inner.lock().await.idle.len()
    }

    pub async fn pending(&self) -> usize {
        self.inner.lock().await.waiters.len()
    }

    /// Sets draining, rejects future acquires, waits (optionally bounded by
    /// `grace_period`) for in-use resources to be released, then closes
    /// every idle resource.
    pub async fn drain(&self, grace_period: Option<Duration>) {
        {
            let mut inner = self.inner.lock().await;
            if inner.draining {
                return;
            }
            inner.draining = true;
            while let Some(waiter) = inner.waiters.pop_front() {
                let _ = waiter.send(Err(Error::PoolDraining));
            }
        }

        let wait_for_release = self.drain_notify.notified();
        let all_idle_now = { self.inner.lock().await.checked_out.is_empty() };
        if !all_idle_now {
            match grace_period {
                Some(grace) => {
                    let _ = tokio::time::timeout(grace, wait_for_release).await;
                }
                None => wait_for_release.await,
            }
        }

        let idle: Vec<IdleEntry<F::Resource>> = {
            let mut inner = self.inner.lock().await;
            inner.idle.drain(..).collect()
        };
        for entry in idle {
            self.factory.close(entry.resource).await;
            let mut inner = self.inner.lock().await;
            inner.size = inner.size.saturating_sub(1);
        }
    }

    /// Periodic sweep closing idle resources older than `idle_timeout`,
    /// respecting `min`. Intended to be driven by a background task the
    /// owner spawns with `tokio::time::interval(config.eviction_interval)`.
    pub async fn evict_idle(&self) {
        let mut inner = self.inner.lock().await;
        if inner.draining {
            return;
        }
        let now = Instant::now();
        let min = self.config.min;
        let mut kept = VecDeque::new();
        let mut to_close = Vec::new();

        while let Some(entry) = inner.idle.pop_front() {
            let total = inner.size - to_close.len();
            if total > min && now.duration_since(entry.last_used_at) >= self.config.idle_timeout {
                to_close.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        inner.idle = kept;
        inner.size = inner.size.saturating_sub(to_close.len());
        drop(inner);

        for entry in to_close {
            self.factory.close(entry.resource).await;
        }
    }
}

/// Production [`ResourceFactory`]: opens a confirm-select `lapin::Channel`
/// on the shared [`ConnectionManager`] connection and tracks it in the
/// manager's channel count, per spec.md §4.1's "tracks channels opened
/// against it".
pub struct LapinChannelFactory {
    connection_manager: Arc<ConnectionManager>,
    confirm_select: bool,
}

impl LapinChannelFactory {
    pub fn new(connection_manager: Arc<ConnectionManager>, confirm_select: bool) -> Self {
        Self { connection_manager, confirm_select }
    }
}

#[async_trait]
impl ResourceFactory for LapinChannelFactory {
    type Resource = lapin::Channel;

    async fn create(&self) -> Result<Self::Resource> {
        let conn = self.connection_manager.get_connection().await?;
        let channel = conn.create_channel().await?;
        if self.confirm_select {
            channel.confirm_select(ConfirmSelectOptions::default()).await?;
        }
        self.connection_manager.note_channel_opened();
        Ok(channel)
    }

    async fn health_check(&self, channel: &Self::Resource) -> bool {
        channel.status().connected()
    }

    async fn close(&self, channel: Self::Resource) {
        let _ = channel.close(200, "pool evicted channel").await;
        self.connection_manager.note_channel_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    struct FakeResource(u64);

    #[derive(Default)]
    struct FakeFactory {
        next: AtomicU64,
        fail_health_check: AtomicBool,
        created: AtomicU64,
        closed: AtomicU64,
    }

    #[async_trait]
    impl ResourceFactory for Arc<FakeFactory> {
        type Resource = FakeResource;

        async fn create(&self) -> Result<Self::Resource> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(FakeResource(self.next.fetch_add(1, Ordering::SeqCst)))
        }

        async fn health_check(&self, _resource: &Self::Resource) -> bool {
            !self.fail_health_check.swap(false, Ordering::SeqCst)
        }

        async fn close(&self, _resource: Self::Resource) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(max: usize) -> ChannelPool<Arc<FakeFactory>> {
        ChannelPool::new(
            Arc::new(FakeFactory::default()),
            ChannelPoolConfig {
                min: 1,
                max,
                acquire_timeout: Duration::from_millis(200),
                eviction_interval: Duration::from_secs(30),
                idle_timeout: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test]
    async fn acquire_release_round_trip_preserves_accounting() {
        let pool = pool(2);
        let r = pool.acquire().await.unwrap();
        assert_eq!(pool.size().await, 1);
        pool.release(r).await;
        assert_eq!(pool.available().await, 1);
        assert_eq!(pool.size().await, 1);
    }

    #[tokio::test]
    async fn saturation_queues_a_waiter_and_release_hands_off_directly() {
        let pool = Arc::new(pool(2));
        let r1 = pool.acquire().await.unwrap();
        let _r2 = pool.acquire().await.unwrap();
        assert_eq!(pool.size().await, 2);

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.pending().await, 1);

        pool.release(r1).await;
        let acquired = waiter.await.unwrap().unwrap();
        assert_eq!(pool.pending().await, 0);
        assert_eq!(pool.size().await, 2);
        pool.release(acquired).await;
    }

    #[tokio::test]
    async fn saturated_acquire_times_out() {
        let pool = pool(1);
        let _r1 = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.code(), "ACQUIRE_TIMEOUT");
    }

    #[tokio::test]
    async fn unhealthy_idle_channel_is_recycled() {
        let factory = Arc::new(FakeFactory::default());
        let pool = ChannelPool::new(factory.clone(), ChannelPoolConfig::default());
        let r1 = pool.acquire().await.unwrap();
        pool.release(r1).await;

        factory.fail_health_check.store(true, Ordering::SeqCst);
        let r2 = pool.acquire().await.unwrap();
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
        assert!(pool.size().await <= ChannelPoolConfig::default().max);
        pool.release(r2).await;
    }

    #[tokio::test]
    async fn release_with_unknown_id_is_a_no_op() {
        let pool = pool(2);
        pool.release(PooledResource { id: 9999, resource: FakeResource(0) }).await;
        assert_eq!(pool.size().await, 0);
    }

    #[tokio::test]
    async fn drain_closes_idle_and_rejects_new_acquires() {
        let pool = pool(2);
        let r1 = pool.acquire().await.unwrap();
        pool.release(r1).await;
        pool.drain(Some(Duration::from_millis(50))).await;
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.code(), "POOL_DRAINING");
        assert_eq!(pool.size().await, 0);
    }

    #[tokio::test]
    async fn eviction_respects_min() {
        let factory = Arc::new(FakeFactory::default());
        let pool = ChannelPool::new(
            factory,
            ChannelPoolConfig {
                min: 1,
                max: 3,
                acquire_timeout: Duration::from_millis(100),
                eviction_interval: Duration::from_secs(30),
                idle_timeout: Duration::from_millis(1),
            },
        );
        let r1 = pool.acquire().await.unwrap();
        let r2 = pool.acquire().await.unwrap();
        pool.release(r1).await;
        pool.release(r2).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.evict_idle().await;
        assert_eq!(pool.size().await, 1);
    }
}
