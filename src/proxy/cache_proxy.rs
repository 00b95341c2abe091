//! Cache Proxy
//!
//! Client-side view of one remote cache. Keyed operations are routed to the
//! partition owner through the dispatcher; reads go through the near-cache
//! when one is configured, and writes invalidate it once they complete.

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::{self, join_all, BoxFuture};
use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, warn};

use crate::cache::{
    CacheStatistics, CacheStatsSnapshot, NearCache, NearCacheLookup, NearCacheRecord,
    NearCacheStats,
};
use crate::cluster::ClientContext;
use crate::config::{CacheConfig, ExpiryPolicy};
use crate::error::{CacheError, Result};
use crate::protocol::{CacheOperation, CacheRequest, CacheResponse, EntryListenerDescriptor};
use crate::proxy::dispatcher::InvocationDispatcher;
use crate::proxy::events::{
    CacheEntryListenerConfiguration, CachePartitionLostListener, EntryEventAdaptor,
    InvalidationHandler, PartitionLostAdaptor,
};
use crate::proxy::iterator::{ClusterWideIterator, DEFAULT_BATCH_SIZE};
use crate::proxy::listeners::ListenerRegistry;
use crate::proxy::processor::{
    EntryProcessor, EntryProcessorResult, ProcessorAdapter, ProcessorArguments,
};
use crate::serialization::{Data, SerializationService};

/// One-shot result of an asynchronous cache operation.
pub type CacheFuture<T> = BoxFuture<'static, Result<T>>;

/// Types usable as cache keys and values.
pub trait CacheType: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheType for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

// == Completion Listener ==
/// Notified when a `load_all` finishes.
pub trait CompletionListener: Send + Sync {
    fn on_completion(&self);

    fn on_exception(&self, error: &CacheError);
}

/// Read-only view of a cache's configuration.
#[derive(Debug, Clone, Serialize)]
pub struct CacheConfigurationView {
    #[serde(flatten)]
    pub config: CacheConfig,
    pub listener_configurations: Vec<EntryListenerDescriptor>,
}

// == Proxy State ==
struct ProxyInner {
    config: CacheConfig,
    context: ClientContext,
    dispatcher: InvocationDispatcher,
    listeners: ListenerRegistry,
    near_cache: Option<NearCache>,
    statistics: CacheStatistics,
    closed: AtomicBool,
}

impl ProxyInner {
    fn request(&self, operation: CacheOperation) -> CacheRequest {
        CacheRequest::new(self.config.name.clone(), operation)
    }

    fn serialization(&self) -> SerializationService {
        self.context.serialization
    }

    fn statistics(&self) -> Option<&CacheStatistics> {
        self.config
            .statistics_enabled
            .then_some(&self.statistics)
    }

    fn invalidate(&self, key: &Data) {
        if let Some(near_cache) = &self.near_cache {
            near_cache.invalidate(key);
        }
    }

    fn invalidate_all(&self) {
        if let Some(near_cache) = &self.near_cache {
            near_cache.clear();
        }
    }

    fn record_get(&self, found: bool, start: Instant) {
        if let Some(stats) = self.statistics() {
            if found {
                stats.record_hit(start);
            } else {
                stats.record_miss(start);
            }
        }
    }

    fn record_puts(&self, count: u64, start: Instant) {
        if let Some(stats) = self.statistics() {
            stats.record_puts(count, start);
        }
    }

    fn record_removals(&self, count: u64, start: Instant) {
        if let Some(stats) = self.statistics() {
            stats.record_removals(count, start);
        }
    }
}

// == Cache Proxy ==
/// Typed handle to a remote cache. Cheap to clone; clones share state.
pub struct CacheProxy<K, V> {
    inner: Arc<ProxyInner>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for CacheProxy<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K, V> fmt::Debug for CacheProxy<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheProxy")
            .field("name", &self.inner.config.name)
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .field("near_cache", &self.inner.near_cache.is_some())
            .finish_non_exhaustive()
    }
}

fn check_declared_type<T: ?Sized>(cache: &str, role: &str, declared: Option<&str>) -> Result<()> {
    match declared {
        Some(declared) if declared != type_name::<T>() => Err(CacheError::Validation(format!(
            "cache {} declares {} type {}, proxy uses {}",
            cache,
            role,
            declared,
            type_name::<T>()
        ))),
        _ => Ok(()),
    }
}

impl<K: CacheType, V: CacheType> CacheProxy<K, V> {
    // == Lifecycle ==
    /// Creates an open proxy for the cache described by `config`.
    ///
    /// With a near-cache configured, the proxy subscribes to the cluster's
    /// invalidations for this cache. A refused subscription is logged and the
    /// proxy still works, relying on its own write invalidation.
    pub async fn create(config: CacheConfig, context: ClientContext) -> Result<Self> {
        check_declared_type::<K>(&config.name, "key", config.key_type.as_deref())?;
        check_declared_type::<V>(&config.name, "value", config.value_type.as_deref())?;

        let dispatcher = InvocationDispatcher::new(context.invocation.clone());
        let listeners = ListenerRegistry::new(
            config.name.clone(),
            context.listeners.clone(),
            context.cluster.clone(),
            dispatcher.clone(),
        );
        let near_cache = config.near_cache.as_ref().map(NearCache::new);

        if let Some(near_cache) = &near_cache {
            let handler = InvalidationHandler::new(config.name.clone(), near_cache.clone());
            if !listeners.register_invalidation(Arc::new(handler)).await {
                warn!(cache = %config.name, "near-cache invalidation listener refused");
            }
        }

        info!(
            cache = %config.name,
            near_cache = near_cache.is_some(),
            statistics = config.statistics_enabled,
            "cache proxy created"
        );

        Ok(Self {
            inner: Arc::new(ProxyInner {
                config,
                context,
                dispatcher,
                listeners,
                near_cache,
                statistics: CacheStatistics::new(),
                closed: AtomicBool::new(false),
            }),
            _marker: PhantomData,
        })
    }

    /// Closes the proxy. Listener registrations are removed best-effort and
    /// the near-cache is dropped. Closing twice does nothing.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.listeners.deregister_all().await;
        self.inner.listeners.drain_propagation().await;
        self.inner.invalidate_all();
        info!(cache = %self.inner.config.name, "cache proxy closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CacheError::Closed(self.inner.config.name.clone()));
        }
        Ok(())
    }

    // == Introspection ==
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Configuration snapshot including the registered listener configurations.
    pub fn configuration(&self) -> Result<CacheConfigurationView> {
        self.ensure_open()?;
        Ok(CacheConfigurationView {
            config: self.inner.config.clone(),
            listener_configurations: self.inner.listeners.descriptors(),
        })
    }

    pub fn statistics(&self) -> CacheStatsSnapshot {
        self.inner.statistics.snapshot()
    }

    pub fn near_cache_stats(&self) -> Option<NearCacheStats> {
        self.inner.near_cache.as_ref().map(NearCache::stats)
    }

    pub fn near_cache(&self) -> Option<NearCache> {
        self.inner.near_cache.clone()
    }

    /// Invocations sent by this proxy that have not completed yet.
    pub fn pending_invocations(&self) -> usize {
        self.inner.dispatcher.pending_count()
    }

    pub(crate) fn serialization(&self) -> SerializationService {
        self.inner.serialization()
    }

    fn to_data<T: Serialize + ?Sized>(&self, object: &T) -> Result<Data> {
        self.inner.serialization().to_data(object)
    }

    fn default_expiry(&self) -> Option<ExpiryPolicy> {
        let policy = self.inner.config.expiry_policy;
        (policy != ExpiryPolicy::eternal()).then_some(policy)
    }

    /// Sends a keyed operation and finishes it once the response arrives.
    ///
    /// The near-cache entry for `key` is invalidated before `finish` runs,
    /// whatever the outcome.
    fn invoke_keyed<T, F>(&self, key: Data, operation: CacheOperation, finish: F) -> CacheFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&ProxyInner, CacheResponse, Instant) -> Result<T> + Send + 'static,
    {
        let start = Instant::now();
        let future = self
            .inner
            .dispatcher
            .invoke(self.inner.request(operation), Some(key.clone()));
        let inner = self.inner.clone();
        async move {
            let response = future.await;
            inner.invalidate(&key);
            finish(&inner, response?, start)
        }
        .boxed()
    }

    // == Get ==
    pub fn get_async(&self, key: &K) -> Result<CacheFuture<Option<V>>> {
        self.get_internal(key, self.default_expiry())
    }

    pub fn get_with_expiry_async(&self, key: &K, expiry: ExpiryPolicy) -> Result<CacheFuture<Option<V>>> {
        self.get_internal(key, Some(expiry))
    }

    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        self.get_async(key)?.await
    }

    pub async fn get_with_expiry(&self, key: &K, expiry: ExpiryPolicy) -> Result<Option<V>> {
        self.get_with_expiry_async(key, expiry)?.await
    }

    fn get_internal(&self, key: &K, expiry: Option<ExpiryPolicy>) -> Result<CacheFuture<Option<V>>> {
        self.ensure_open()?;
        let start = Instant::now();
        let key = self.to_data(key)?;
        let ss = self.inner.serialization();

        let mut epoch = None;
        if let Some(near_cache) = &self.inner.near_cache {
            if let NearCacheLookup::Present(value) = near_cache.get(&key) {
                self.inner.record_get(true, start);
                let value = ss.to_object(&value).map(Some);
                return Ok(future::ready(value).boxed());
            }
            epoch = Some(near_cache.epoch());
        }

        let future = self.inner.dispatcher.invoke(
            self.inner.request(CacheOperation::Get {
                key: key.clone(),
                expiry,
            }),
            Some(key.clone()),
        );
        let inner = self.inner.clone();
        Ok(async move {
            let value = future.await?.into_value("get")?;
            if let (Some(near_cache), Some(epoch)) = (&inner.near_cache, epoch) {
                near_cache.put_if_current(key, NearCacheRecord::from_remote(value.clone()), epoch);
            }
            inner.record_get(value.is_some(), start);
            ss.to_object_opt(value.as_ref())
        }
        .boxed())
    }

    // == Get All ==
    pub fn get_all_async(&self, keys: &[K]) -> Result<CacheFuture<HashMap<K, V>>>
    where
        K: Eq + Hash,
    {
        self.get_all_internal(keys, self.default_expiry())
    }

    pub async fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>>
    where
        K: Eq + Hash,
    {
        self.get_all_async(keys)?.await
    }

    pub async fn get_all_with_expiry(&self, keys: &[K], expiry: ExpiryPolicy) -> Result<HashMap<K, V>>
    where
        K: Eq + Hash,
    {
        self.get_all_internal(keys, Some(expiry))?.await
    }

    fn get_all_internal(
        &self,
        keys: &[K],
        expiry: Option<ExpiryPolicy>,
    ) -> Result<CacheFuture<HashMap<K, V>>>
    where
        K: Eq + Hash,
    {
        self.ensure_open()?;
        let start = Instant::now();
        let ss = self.inner.serialization();

        let mut result = HashMap::new();
        let mut misses = Vec::new();
        for key in keys {
            let data = self.to_data(key)?;
            if let Some(near_cache) = &self.inner.near_cache {
                if let NearCacheLookup::Present(value) = near_cache.get(&data) {
                    result.insert(ss.to_object(&data)?, ss.to_object(&value)?);
                    continue;
                }
            }
            misses.push(data);
        }
        let near_hits = result.len() as u64;

        if misses.is_empty() {
            if let Some(stats) = self.inner.statistics() {
                stats.record_gets(near_hits, 0, start);
            }
            return Ok(future::ready(Ok(result)).boxed());
        }

        let epoch = self.inner.near_cache.as_ref().map(NearCache::epoch);
        let future = self.inner.dispatcher.invoke(
            self.inner.request(CacheOperation::GetAll {
                keys: misses.clone(),
                expiry,
            }),
            None,
        );
        let inner = self.inner.clone();
        Ok(async move {
            let found: HashMap<Data, Data> =
                future.await?.into_entries("get_all")?.into_iter().collect();

            if let (Some(near_cache), Some(epoch)) = (&inner.near_cache, epoch) {
                for key in &misses {
                    let record = NearCacheRecord::from_remote(found.get(key).cloned());
                    near_cache.put_if_current(key.clone(), record, epoch);
                }
            }
            if let Some(stats) = inner.statistics() {
                // A reply may carry keys that were not asked for
                let remote_hits = misses.iter().filter(|k| found.contains_key(*k)).count() as u64;
                let remote_misses = (misses.len() as u64).saturating_sub(remote_hits);
                stats.record_gets(near_hits + remote_hits, remote_misses, start);
            }

            for (key, value) in &found {
                result.insert(ss.to_object(key)?, ss.to_object(value)?);
            }
            Ok::<_, CacheError>(result)
        }
        .boxed())
    }

    // == Contains Key ==
    pub fn contains_key_async(&self, key: &K) -> Result<CacheFuture<bool>> {
        self.ensure_open()?;
        let key = self.to_data(key)?;
        if let Some(near_cache) = &self.inner.near_cache {
            if let NearCacheLookup::Present(_) = near_cache.get(&key) {
                return Ok(future::ready(Ok(true)).boxed());
            }
        }
        let future = self.inner.dispatcher.invoke(
            self.inner.request(CacheOperation::ContainsKey { key: key.clone() }),
            Some(key),
        );
        Ok(async move {
            let exists = future.await?.into_bool("contains_key")?;
            Ok::<_, CacheError>(exists)
        }
        .boxed())
    }

    pub async fn contains_key(&self, key: &K) -> Result<bool> {
        self.contains_key_async(key)?.await
    }

    // == Put ==
    fn put_internal(
        &self,
        key: &K,
        value: &V,
        expiry: Option<ExpiryPolicy>,
        get_old: bool,
    ) -> Result<CacheFuture<Option<V>>> {
        self.ensure_open()?;
        let key = self.to_data(key)?;
        let operation = CacheOperation::Put {
            key: key.clone(),
            value: self.to_data(value)?,
            expiry,
            get_old,
            if_absent: false,
        };
        Ok(self.invoke_keyed(key, operation, move |inner, response, start| {
            let old = if get_old {
                response.into_value("get_and_put")?
            } else {
                response.into_unit("put")?;
                None
            };
            inner.record_puts(1, start);
            if get_old {
                inner.record_get(old.is_some(), start);
            }
            inner.serialization().to_object_opt(old.as_ref())
        }))
    }

    pub fn put_async(&self, key: &K, value: &V) -> Result<CacheFuture<()>> {
        let future = self.put_internal(key, value, self.default_expiry(), false)?;
        Ok(future.map(|r| r.map(|_| ())).boxed())
    }

    pub async fn put(&self, key: &K, value: &V) -> Result<()> {
        self.put_async(key, value)?.await
    }

    pub async fn put_with_expiry(&self, key: &K, value: &V, expiry: ExpiryPolicy) -> Result<()> {
        self.put_internal(key, value, Some(expiry), false)?.await.map(|_| ())
    }

    /// Stores `value` and returns the value it replaced.
    pub fn get_and_put_async(&self, key: &K, value: &V) -> Result<CacheFuture<Option<V>>> {
        self.put_internal(key, value, self.default_expiry(), true)
    }

    pub async fn get_and_put(&self, key: &K, value: &V) -> Result<Option<V>> {
        self.get_and_put_async(key, value)?.await
    }

    pub async fn get_and_put_with_expiry(
        &self,
        key: &K,
        value: &V,
        expiry: ExpiryPolicy,
    ) -> Result<Option<V>> {
        self.put_internal(key, value, Some(expiry), true)?.await
    }

    fn put_if_absent_internal(
        &self,
        key: &K,
        value: &V,
        expiry: Option<ExpiryPolicy>,
    ) -> Result<CacheFuture<bool>> {
        self.ensure_open()?;
        let key = self.to_data(key)?;
        let operation = CacheOperation::Put {
            key: key.clone(),
            value: self.to_data(value)?,
            expiry,
            get_old: false,
            if_absent: true,
        };
        Ok(self.invoke_keyed(key, operation, |inner, response, start| {
            let stored = response.into_bool("put_if_absent")?;
            if stored {
                inner.record_puts(1, start);
            }
            Ok(stored)
        }))
    }

    /// Stores `value` only if `key` has no value. Returns true if stored.
    pub fn put_if_absent_async(&self, key: &K, value: &V) -> Result<CacheFuture<bool>> {
        self.put_if_absent_internal(key, value, self.default_expiry())
    }

    pub async fn put_if_absent(&self, key: &K, value: &V) -> Result<bool> {
        self.put_if_absent_async(key, value)?.await
    }

    pub async fn put_if_absent_with_expiry(
        &self,
        key: &K,
        value: &V,
        expiry: ExpiryPolicy,
    ) -> Result<bool> {
        self.put_if_absent_internal(key, value, Some(expiry))?.await
    }

    /// Stores every entry, one invocation per key, all in flight at once.
    /// Returns the first failure after every invocation has completed.
    pub async fn put_all<'a, I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a K, &'a V)>,
        K: 'a,
        V: 'a,
    {
        self.put_all_internal(entries, self.default_expiry()).await
    }

    pub async fn put_all_with_expiry<'a, I>(&self, entries: I, expiry: ExpiryPolicy) -> Result<()>
    where
        I: IntoIterator<Item = (&'a K, &'a V)>,
        K: 'a,
        V: 'a,
    {
        self.put_all_internal(entries, Some(expiry)).await
    }

    async fn put_all_internal<'a, I>(&self, entries: I, expiry: Option<ExpiryPolicy>) -> Result<()>
    where
        I: IntoIterator<Item = (&'a K, &'a V)>,
        K: 'a,
        V: 'a,
    {
        self.ensure_open()?;
        let start = Instant::now();
        let mut futures = Vec::new();
        for (key, value) in entries {
            let key = self.to_data(key)?;
            let operation = CacheOperation::Put {
                key: key.clone(),
                value: self.to_data(value)?,
                expiry,
                get_old: false,
                if_absent: false,
            };
            futures.push(self.invoke_keyed(key, operation, |_, response, _| {
                Ok(response.into_unit("put_all")?)
            }));
        }

        let results = join_all(futures).await;
        let stored = results.iter().filter(|r| r.is_ok()).count() as u64;
        if stored > 0 {
            self.inner.record_puts(stored, start);
        }
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    // == Remove ==
    pub(crate) fn remove_data_async(&self, key: Data) -> Result<CacheFuture<bool>> {
        self.ensure_open()?;
        let operation = CacheOperation::Remove {
            key: key.clone(),
            old_value: None,
            get_old: false,
        };
        Ok(self.invoke_keyed(key, operation, |inner, response, start| {
            let removed = response.into_bool("remove")?;
            if removed {
                inner.record_removals(1, start);
            }
            Ok(removed)
        }))
    }

    pub(crate) async fn remove_data(&self, key: Data) -> Result<bool> {
        self.remove_data_async(key)?.await
    }

    /// Removes `key`. Returns true if a value was removed.
    pub fn remove_async(&self, key: &K) -> Result<CacheFuture<bool>> {
        self.ensure_open()?;
        self.remove_data_async(self.to_data(key)?)
    }

    pub async fn remove(&self, key: &K) -> Result<bool> {
        self.remove_async(key)?.await
    }

    /// Removes `key` only while it maps to `old_value`.
    pub fn remove_if_same_async(&self, key: &K, old_value: &V) -> Result<CacheFuture<bool>> {
        self.ensure_open()?;
        let key = self.to_data(key)?;
        let operation = CacheOperation::Remove {
            key: key.clone(),
            old_value: Some(self.to_data(old_value)?),
            get_old: false,
        };
        Ok(self.invoke_keyed(key, operation, |inner, response, start| {
            let removed = response.into_bool("remove")?;
            if removed {
                inner.record_removals(1, start);
            }
            Ok(removed)
        }))
    }

    pub async fn remove_if_same(&self, key: &K, old_value: &V) -> Result<bool> {
        self.remove_if_same_async(key, old_value)?.await
    }

    pub fn get_and_remove_async(&self, key: &K) -> Result<CacheFuture<Option<V>>> {
        self.ensure_open()?;
        let key = self.to_data(key)?;
        let operation = CacheOperation::Remove {
            key: key.clone(),
            old_value: None,
            get_old: true,
        };
        Ok(self.invoke_keyed(key, operation, |inner, response, start| {
            let old = response.into_value("get_and_remove")?;
            inner.record_get(old.is_some(), start);
            if old.is_some() {
                inner.record_removals(1, start);
            }
            inner.serialization().to_object_opt(old.as_ref())
        }))
    }

    pub async fn get_and_remove(&self, key: &K) -> Result<Option<V>> {
        self.get_and_remove_async(key)?.await
    }

    // == Replace ==
    fn replace_internal(
        &self,
        key: &K,
        old_value: Option<&V>,
        new_value: &V,
        expiry: Option<ExpiryPolicy>,
    ) -> Result<CacheFuture<bool>> {
        self.ensure_open()?;
        let key = self.to_data(key)?;
        let operation = CacheOperation::Replace {
            key: key.clone(),
            old_value: old_value.map(|v| self.to_data(v)).transpose()?,
            new_value: self.to_data(new_value)?,
            expiry,
            get_old: false,
        };
        Ok(self.invoke_keyed(key, operation, |inner, response, start| {
            let replaced = response.into_bool("replace")?;
            if replaced {
                inner.record_puts(1, start);
            }
            Ok(replaced)
        }))
    }

    /// Replaces the value of `key` only if it has one.
    pub fn replace_async(&self, key: &K, value: &V) -> Result<CacheFuture<bool>> {
        self.replace_internal(key, None, value, self.default_expiry())
    }

    pub async fn replace(&self, key: &K, value: &V) -> Result<bool> {
        self.replace_async(key, value)?.await
    }

    pub async fn replace_with_expiry(&self, key: &K, value: &V, expiry: ExpiryPolicy) -> Result<bool> {
        self.replace_internal(key, None, value, Some(expiry))?.await
    }

    /// Replaces the value of `key` only while it maps to `old_value`.
    pub fn replace_if_same_async(&self, key: &K, old_value: &V, new_value: &V) -> Result<CacheFuture<bool>> {
        self.replace_internal(key, Some(old_value), new_value, self.default_expiry())
    }

    pub async fn replace_if_same(&self, key: &K, old_value: &V, new_value: &V) -> Result<bool> {
        self.replace_if_same_async(key, old_value, new_value)?.await
    }

    pub async fn replace_if_same_with_expiry(
        &self,
        key: &K,
        old_value: &V,
        new_value: &V,
        expiry: ExpiryPolicy,
    ) -> Result<bool> {
        self.replace_internal(key, Some(old_value), new_value, Some(expiry))?
            .await
    }

    fn get_and_replace_internal(
        &self,
        key: &K,
        value: &V,
        expiry: Option<ExpiryPolicy>,
    ) -> Result<CacheFuture<Option<V>>> {
        self.ensure_open()?;
        let key = self.to_data(key)?;
        let operation = CacheOperation::Replace {
            key: key.clone(),
            old_value: None,
            new_value: self.to_data(value)?,
            expiry,
            get_old: true,
        };
        Ok(self.invoke_keyed(key, operation, |inner, response, start| {
            let old = response.into_value("get_and_replace")?;
            inner.record_get(old.is_some(), start);
            if old.is_some() {
                inner.record_puts(1, start);
            }
            inner.serialization().to_object_opt(old.as_ref())
        }))
    }

    pub fn get_and_replace_async(&self, key: &K, value: &V) -> Result<CacheFuture<Option<V>>> {
        self.get_and_replace_internal(key, value, self.default_expiry())
    }

    pub async fn get_and_replace(&self, key: &K, value: &V) -> Result<Option<V>> {
        self.get_and_replace_async(key, value)?.await
    }

    pub async fn get_and_replace_with_expiry(
        &self,
        key: &K,
        value: &V,
        expiry: ExpiryPolicy,
    ) -> Result<Option<V>> {
        self.get_and_replace_internal(key, value, Some(expiry))?.await
    }

    // == Bulk Removal ==
    /// Removes the given keys, firing a removed event per entry.
    pub async fn remove_keys(&self, keys: &[K]) -> Result<u64> {
        self.ensure_open()?;
        let start = Instant::now();
        let keys = keys
            .iter()
            .map(|k| self.to_data(k))
            .collect::<Result<Vec<_>>>()?;

        let result = self
            .inner
            .dispatcher
            .invoke(
                self.inner.request(CacheOperation::RemoveAll {
                    keys: Some(keys.clone()),
                }),
                None,
            )
            .await;
        if let Some(near_cache) = &self.inner.near_cache {
            near_cache.invalidate_all(&keys);
        }

        let removed = result?.into_count("remove_all")?;
        self.inner.record_removals(removed, start);
        Ok(removed)
    }

    /// Removes every entry, firing a removed event per entry.
    pub async fn remove_all(&self) -> Result<u64> {
        self.ensure_open()?;
        let start = Instant::now();
        let result = self
            .inner
            .dispatcher
            .invoke(self.inner.request(CacheOperation::RemoveAll { keys: None }), None)
            .await;
        self.inner.invalidate_all();

        let removed = result?.into_count("remove_all")?;
        self.inner.record_removals(removed, start);
        Ok(removed)
    }

    /// Empties the cache without per-entry events or statistics.
    pub async fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        let result = self
            .inner
            .dispatcher
            .invoke(self.inner.request(CacheOperation::Clear), None)
            .await;
        self.inner.invalidate_all();
        Ok(result?.into_unit("clear")?)
    }

    /// Number of entries across the cluster.
    pub async fn size(&self) -> Result<u64> {
        self.ensure_open()?;
        let response = self
            .inner
            .dispatcher
            .invoke(self.inner.request(CacheOperation::Size), None)
            .await?;
        Ok(response.into_count("size")?)
    }

    // == Load All ==
    /// Loads `keys` through the cluster's cache loader in the background.
    ///
    /// On success every requested key is credited as a put, since the loader
    /// does not report which keys it actually stored. Failures reach both the
    /// completion listener and the returned future as [`CacheError::Load`].
    pub fn load_all(
        &self,
        keys: &[K],
        replace_existing: bool,
        listener: Option<Arc<dyn CompletionListener>>,
    ) -> Result<CacheFuture<()>> {
        self.ensure_open()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CacheError::Internal(format!("load_all needs a tokio runtime: {}", e)))?;
        let start = Instant::now();
        let keys = keys
            .iter()
            .map(|k| self.to_data(k))
            .collect::<Result<Vec<_>>>()?;

        let future = self.inner.dispatcher.invoke(
            self.inner.request(CacheOperation::LoadAll {
                keys: keys.clone(),
                replace_existing,
            }),
            None,
        );
        let inner = self.inner.clone();
        let task = runtime.spawn(async move {
            let outcome = match future.await {
                Ok(response) => response.into_unit("load_all").map_err(CacheError::from),
                Err(err) => Err(CacheError::from(err)),
            };
            match outcome {
                Ok(()) => {
                    if let Some(near_cache) = &inner.near_cache {
                        near_cache.invalidate_all(&keys);
                    }
                    inner.record_puts(keys.len() as u64, start);
                    if let Some(listener) = &listener {
                        listener.on_completion();
                    }
                    Ok(())
                }
                Err(err) => {
                    let err = match err {
                        CacheError::Load(_) => err,
                        other => CacheError::Load(other.to_string()),
                    };
                    warn!(cache = %inner.config.name, error = %err, "load_all failed");
                    if let Some(listener) = &listener {
                        listener.on_exception(&err);
                    }
                    Err(err)
                }
            }
        });

        Ok(async move {
            task.await
                .map_err(|e| CacheError::Internal(format!("load_all task failed: {}", e)))?
        }
        .boxed())
    }

    // == Entry Processors ==
    fn invoke_shared<P>(
        &self,
        key: &K,
        processor: Arc<P>,
        arguments: &ProcessorArguments,
    ) -> Result<CacheFuture<Option<P::Output>>>
    where
        P: EntryProcessor<K, V>,
    {
        self.ensure_open()?;
        let key = self.to_data(key)?;
        let ss = self.inner.serialization();
        let operation = CacheOperation::EntryProcessor {
            key: key.clone(),
            processor: Arc::new(ProcessorAdapter::<K, V, P>::new(processor, ss)),
            arguments: arguments.clone().into_data(),
        };
        Ok(self.invoke_keyed(key, operation, move |_, response, _| {
            let output = response.into_value("entry_processor")?;
            ss.to_object_opt(output.as_ref())
        }))
    }

    /// Runs `processor` on the owner of `key`. `None` means the processor
    /// returned null.
    pub fn invoke_async<P>(
        &self,
        key: &K,
        processor: P,
        arguments: &ProcessorArguments,
    ) -> Result<CacheFuture<Option<P::Output>>>
    where
        P: EntryProcessor<K, V>,
    {
        self.invoke_shared(key, Arc::new(processor), arguments)
    }

    pub async fn invoke<P>(
        &self,
        key: &K,
        processor: P,
        arguments: &ProcessorArguments,
    ) -> Result<Option<P::Output>>
    where
        P: EntryProcessor<K, V>,
    {
        self.invoke_async(key, processor, arguments)?.await
    }

    /// Runs `processor` on each key in turn. A failing key is recorded in the
    /// result and does not stop the others; keys whose processor returned
    /// null are left out.
    pub async fn invoke_all<P>(
        &self,
        keys: &[K],
        processor: P,
        arguments: &ProcessorArguments,
    ) -> Result<HashMap<K, EntryProcessorResult<P::Output>>>
    where
        K: Eq + Hash + Clone,
        P: EntryProcessor<K, V>,
    {
        self.ensure_open()?;
        let processor = Arc::new(processor);
        let mut results = HashMap::new();
        for key in keys {
            let outcome = match self.invoke_shared(key, processor.clone(), arguments) {
                Ok(future) => future.await,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(Some(output)) => {
                    results.insert(key.clone(), Ok(output));
                }
                Ok(None) => {}
                Err(err) => {
                    results.insert(key.clone(), Err(err));
                }
            }
        }
        Ok(results)
    }

    // == Iteration ==
    pub fn iterator(&self) -> Result<ClusterWideIterator<K, V>> {
        self.iterator_with_batch_size(DEFAULT_BATCH_SIZE)
    }

    pub fn iterator_with_batch_size(&self, batch_size: usize) -> Result<ClusterWideIterator<K, V>> {
        self.ensure_open()?;
        if batch_size == 0 {
            return Err(CacheError::Validation(
                "iterator batch size must be positive".to_string(),
            ));
        }
        let partition_count = self.inner.context.partitions.partition_count();
        Ok(ClusterWideIterator::new(self.clone(), batch_size, partition_count))
    }

    pub(crate) async fn fetch_partition_batch(
        &self,
        partition_id: u32,
        after: Option<Data>,
        batch_size: usize,
    ) -> Result<(Vec<(Data, Data)>, bool)> {
        self.ensure_open()?;
        let request = self.inner.request(CacheOperation::Iterate {
            partition_id,
            after,
            batch_size,
        });
        let response = self
            .inner
            .dispatcher
            .invoke_on_partition(request, partition_id)
            .await?;
        Ok(response.into_batch("iterate")?)
    }

    // == Listeners ==
    /// Registers an entry listener on every member. Returns the registration
    /// id; registering the same configuration again returns the same id.
    pub async fn register_cache_entry_listener(
        &self,
        configuration: &CacheEntryListenerConfiguration<K, V>,
    ) -> Result<String> {
        self.ensure_open()?;
        let handler = EntryEventAdaptor::new(
            self.inner.config.name.clone(),
            configuration.clone(),
            self.inner.serialization(),
        );
        self.inner
            .listeners
            .register_entry_listener(configuration.descriptor(), Arc::new(handler))
            .await
    }

    /// Returns false when the configuration was not registered.
    pub async fn deregister_cache_entry_listener(
        &self,
        configuration: &CacheEntryListenerConfiguration<K, V>,
    ) -> Result<bool> {
        self.ensure_open()?;
        Ok(self
            .inner
            .listeners
            .deregister_entry_listener(configuration.id())
            .await)
    }

    /// Waits until listener configuration changes reached every member.
    pub async fn await_listener_propagation(&self) {
        self.inner.listeners.drain_propagation().await;
    }

    pub async fn add_partition_lost_listener(
        &self,
        listener: impl CachePartitionLostListener + 'static,
    ) -> Result<String> {
        self.ensure_open()?;
        let handler = PartitionLostAdaptor::new(
            self.inner.config.name.clone(),
            Arc::new(listener),
            self.inner.context.cluster.clone(),
        );
        self.inner
            .listeners
            .register_partition_lost(Arc::new(handler))
            .await
    }

    pub async fn remove_partition_lost_listener(&self, registration_id: &str) -> Result<bool> {
        self.ensure_open()?;
        if registration_id.is_empty() {
            return Err(CacheError::Validation(
                "registration id must not be empty".to_string(),
            ));
        }
        Ok(self
            .inner
            .listeners
            .deregister_partition_lost(registration_id)
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Invocation, InvocationFuture, InvocationService, LocalCluster};
    use crate::config::NearCacheConfig;
    use crate::proxy::processor::{MutableEntry, ProcessorError};
    use std::time::Duration;

    async fn proxy_on(cluster: &Arc<LocalCluster>, config: CacheConfig) -> CacheProxy<String, String> {
        CacheProxy::create(config, ClientContext::from_service(cluster.clone()))
            .await
            .unwrap()
    }

    fn near_cached(name: &str) -> CacheConfig {
        CacheConfig::new(name)
            .with_statistics(true)
            .with_near_cache(NearCacheConfig::default())
    }

    fn s(text: &str) -> String {
        text.to_string()
    }

    #[tokio::test]
    async fn test_declared_type_mismatch_is_rejected() {
        let cluster = Arc::new(LocalCluster::new(1, 4));
        let config = CacheConfig::new("typed").with_types::<u64, String>();

        let result: Result<CacheProxy<String, String>> =
            CacheProxy::create(config, ClientContext::from_service(cluster)).await;

        assert!(matches!(result, Err(CacheError::Validation(msg)) if msg.contains("key")));
    }

    #[tokio::test]
    async fn test_get_populates_near_cache_including_null_marker() {
        let cluster = Arc::new(LocalCluster::new(2, 8));
        let proxy = proxy_on(&cluster, near_cached("users")).await;
        let near_cache = proxy.near_cache().unwrap();

        proxy.put(&s("alice"), &s("1")).await.unwrap();
        assert_eq!(proxy.get(&s("alice")).await.unwrap(), Some(s("1")));
        assert_eq!(proxy.get(&s("nobody")).await.unwrap(), None);

        let ss = SerializationService::new();
        assert_eq!(
            near_cache.get(&ss.to_data("alice").unwrap()),
            NearCacheLookup::Present(ss.to_data("1").unwrap())
        );
        assert_eq!(near_cache.get(&ss.to_data("nobody").unwrap()), NearCacheLookup::Null);
    }

    #[tokio::test]
    async fn test_null_marker_does_not_short_circuit() {
        let cluster = Arc::new(LocalCluster::new(2, 8));
        let proxy = proxy_on(&cluster, near_cached("users")).await;

        assert!(!proxy.contains_key(&s("late")).await.unwrap());
        assert_eq!(proxy.get(&s("late")).await.unwrap(), None);

        let before = cluster.invocation_count();
        assert_eq!(proxy.get(&s("late")).await.unwrap(), None);
        assert_eq!(cluster.invocation_count(), before + 1);
    }

    #[tokio::test]
    async fn test_write_statistics() {
        let cluster = Arc::new(LocalCluster::new(2, 8));
        let proxy = proxy_on(&cluster, near_cached("users")).await;

        proxy.put(&s("a"), &s("1")).await.unwrap();
        assert!(!proxy.put_if_absent(&s("a"), &s("2")).await.unwrap());
        assert!(proxy.replace(&s("a"), &s("3")).await.unwrap());
        assert!(!proxy.remove(&s("missing")).await.unwrap());
        assert_eq!(proxy.get_and_remove(&s("a")).await.unwrap(), Some(s("3")));

        let stats = proxy.statistics();
        assert_eq!(stats.puts, 2);
        assert_eq!(stats.removals, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_statistics_disabled_records_nothing() {
        let cluster = Arc::new(LocalCluster::new(1, 4));
        let proxy = proxy_on(&cluster, CacheConfig::new("quiet")).await;

        proxy.put(&s("a"), &s("1")).await.unwrap();
        proxy.get(&s("a")).await.unwrap();

        assert_eq!(proxy.statistics(), CacheStatsSnapshot::default());
    }

    #[tokio::test]
    async fn test_get_all_merges_near_cache_and_remote() {
        let cluster = Arc::new(LocalCluster::new(2, 8));
        let proxy = proxy_on(&cluster, near_cached("users")).await;
        proxy.put(&s("a"), &s("1")).await.unwrap();
        proxy.put(&s("b"), &s("2")).await.unwrap();
        proxy.get(&s("a")).await.unwrap();

        let all = proxy
            .get_all(&[s("a"), s("b"), s("c")])
            .await
            .unwrap();

        assert_eq!(all.len(), 2);
        assert_eq!(all[&s("a")], "1");
        assert_eq!(all[&s("b")], "2");
        let stats = proxy.statistics();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_stale_read_is_not_cached_after_invalidation() {
        let cluster = Arc::new(LocalCluster::new(1, 4));
        let proxy = proxy_on(&cluster, near_cached("users")).await;
        proxy.put(&s("k"), &s("old")).await.unwrap();

        let pending = proxy.get_async(&s("k")).unwrap();
        proxy.put(&s("k"), &s("new")).await.unwrap();
        assert_eq!(pending.await.unwrap(), Some(s("old")));

        assert_eq!(proxy.get(&s("k")).await.unwrap(), Some(s("new")));
    }

    #[tokio::test]
    async fn test_expiry_policy_is_applied_on_the_cluster() {
        let cluster = Arc::new(LocalCluster::new(1, 4));
        let proxy = proxy_on(&cluster, CacheConfig::new("ttl")).await;

        proxy
            .put_with_expiry(&s("k"), &s("v"), ExpiryPolicy::created(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(proxy.contains_key(&s("k")).await.unwrap());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!proxy.contains_key(&s("k")).await.unwrap());
    }

    struct Append;

    impl EntryProcessor<String, String> for Append {
        type Output = usize;

        fn process(
            &self,
            entry: &mut MutableEntry<String, String>,
            arguments: &ProcessorArguments,
        ) -> std::result::Result<usize, ProcessorError> {
            let suffix: String = arguments.get(0)?;
            let value = format!("{}{}", entry.value().cloned().unwrap_or_default(), suffix);
            let len = value.len();
            entry.set_value(value);
            Ok(len)
        }
    }

    #[tokio::test]
    async fn test_invoke_invalidates_near_cache_and_skips_statistics() {
        let cluster = Arc::new(LocalCluster::new(2, 8));
        let proxy = proxy_on(&cluster, near_cached("users")).await;
        proxy.put(&s("k"), &s("ab")).await.unwrap();
        proxy.get(&s("k")).await.unwrap();
        let before = proxy.statistics();

        let args = ProcessorArguments::new().with("cd").unwrap();
        let len = proxy.invoke(&s("k"), Append, &args).await.unwrap();

        assert_eq!(len, Some(4));
        assert_eq!(proxy.statistics(), before);
        assert_eq!(proxy.get(&s("k")).await.unwrap(), Some(s("abcd")));
    }

    #[tokio::test]
    async fn test_pending_invocations_drain() {
        let cluster = Arc::new(LocalCluster::new(1, 4));
        let proxy = proxy_on(&cluster, CacheConfig::new("users")).await;

        let future = proxy.put_async(&s("k"), &s("v")).unwrap();
        assert_eq!(proxy.pending_invocations(), 1);
        future.await.unwrap();
        assert_eq!(proxy.pending_invocations(), 0);
    }

    #[tokio::test]
    async fn test_configuration_lists_listener_configurations() {
        let cluster = Arc::new(LocalCluster::new(2, 4));
        let proxy = proxy_on(&cluster, CacheConfig::new("users")).await;
        let listener = CacheEntryListenerConfiguration::new(
            |_: &crate::proxy::events::CacheEntryEvent<String, String>| {},
        );

        proxy.register_cache_entry_listener(&listener).await.unwrap();
        let view = proxy.configuration().unwrap();
        assert_eq!(view.listener_configurations.len(), 1);
        assert_eq!(view.listener_configurations[0].id, listener.id());

        proxy.deregister_cache_entry_listener(&listener).await.unwrap();
        assert!(proxy.configuration().unwrap().listener_configurations.is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_registrations() {
        let cluster = Arc::new(LocalCluster::new(2, 4));
        let proxy = proxy_on(&cluster, near_cached("users")).await;
        proxy
            .add_partition_lost_listener(|_: crate::proxy::events::CachePartitionLostEvent| {})
            .await
            .unwrap();
        assert_eq!(cluster.registered_listener_count(), 2);

        proxy.close().await;
        proxy.close().await;

        assert!(proxy.is_closed());
        assert_eq!(cluster.registered_listener_count(), 0);
        assert!(matches!(proxy.configuration(), Err(CacheError::Closed(_))));
    }

    /// Appends an entry nobody asked for to every get_all reply.
    struct Padded(Arc<LocalCluster>);

    impl InvocationService for Padded {
        fn invoke(&self, invocation: Invocation) -> InvocationFuture {
            let is_get_all = matches!(invocation.request.operation, CacheOperation::GetAll { .. });
            let reply = self.0.invoke(invocation);
            async move {
                match reply.await? {
                    CacheResponse::Entries(mut entries) if is_get_all => {
                        let extra = SerializationService::new();
                        for key in ["x", "y"] {
                            entries.push((extra.to_data(key).unwrap(), extra.to_data("9").unwrap()));
                        }
                        Ok(CacheResponse::Entries(entries))
                    }
                    other => Ok(other),
                }
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_get_all_statistics_ignore_unrequested_entries() {
        let cluster = Arc::new(LocalCluster::new(1, 4));
        let mut context = ClientContext::from_service(cluster.clone());
        context.invocation = Arc::new(Padded(cluster.clone()));
        let proxy: CacheProxy<String, String> =
            CacheProxy::create(CacheConfig::new("users").with_statistics(true), context)
                .await
                .unwrap();
        proxy.put(&s("a"), &s("1")).await.unwrap();

        proxy.get_all(&[s("a")]).await.unwrap();

        let stats = proxy.statistics();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.gets, 1);
    }
}
