//! Cache events and listener configuration
//!
//! Typed entry and partition-lost events, the listener traits applications
//! implement, and the handlers that translate wire events into them.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::warn;
use uuid::Uuid;

use crate::cache::NearCache;
use crate::cluster::{ClusterEvent, ClusterService, EntryEventData, EventHandler, Member};
use crate::error::Result;
use crate::protocol::{CacheEventType, EntryListenerDescriptor};
use crate::serialization::SerializationService;

// == Entry Events ==
/// A mutation of one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntryEvent<K, V> {
    pub cache_name: String,
    pub event_type: CacheEventType,
    pub key: K,
    /// New value; `None` for removals and expirations
    pub value: Option<V>,
    /// Previous value; only filled in when the configuration asks for it
    pub old_value: Option<V>,
}

/// Receives entry events.
pub trait CacheEntryListener<K, V>: Send + Sync {
    fn on_event(&self, event: &CacheEntryEvent<K, V>);
}

impl<K, V, F> CacheEntryListener<K, V> for F
where
    F: Fn(&CacheEntryEvent<K, V>) + Send + Sync,
{
    fn on_event(&self, event: &CacheEntryEvent<K, V>) {
        self(event)
    }
}

const ENTRY_EVENT_TYPES: [CacheEventType; 4] = [
    CacheEventType::Created,
    CacheEventType::Updated,
    CacheEventType::Removed,
    CacheEventType::Expired,
];

// == Listener Configuration ==
/// An entry listener plus the events it wants.
///
/// Clones share one identity; registering a clone is registering the same
/// configuration.
pub struct CacheEntryListenerConfiguration<K, V> {
    id: Uuid,
    listener: Arc<dyn CacheEntryListener<K, V>>,
    event_types: Vec<CacheEventType>,
    old_value_required: bool,
    synchronous: bool,
}

impl<K, V> CacheEntryListenerConfiguration<K, V> {
    /// Listens to created, updated, removed and expired events.
    pub fn new(listener: impl CacheEntryListener<K, V> + 'static) -> Self {
        Self {
            id: Uuid::new_v4(),
            listener: Arc::new(listener),
            event_types: ENTRY_EVENT_TYPES.to_vec(),
            old_value_required: false,
            synchronous: false,
        }
    }

    /// Restricts delivery to the given event types.
    pub fn with_event_types(mut self, event_types: &[CacheEventType]) -> Self {
        self.event_types = event_types
            .iter()
            .copied()
            .filter(|t| ENTRY_EVENT_TYPES.contains(t))
            .collect();
        self
    }

    pub fn with_old_value_required(mut self, required: bool) -> Self {
        self.old_value_required = required;
        self
    }

    pub fn with_synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn descriptor(&self) -> EntryListenerDescriptor {
        EntryListenerDescriptor {
            id: self.id,
            event_types: self.event_types.clone(),
            old_value_required: self.old_value_required,
            synchronous: self.synchronous,
        }
    }
}

impl<K, V> Clone for CacheEntryListenerConfiguration<K, V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            listener: self.listener.clone(),
            event_types: self.event_types.clone(),
            old_value_required: self.old_value_required,
            synchronous: self.synchronous,
        }
    }
}

impl<K, V> fmt::Debug for CacheEntryListenerConfiguration<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntryListenerConfiguration")
            .field("id", &self.id)
            .field("event_types", &self.event_types)
            .field("old_value_required", &self.old_value_required)
            .field("synchronous", &self.synchronous)
            .finish_non_exhaustive()
    }
}

// == Partition Lost ==
/// A partition of the cache lost all its replicas.
#[derive(Debug, Clone, PartialEq)]
pub struct CachePartitionLostEvent {
    pub cache_name: String,
    /// Member that reported the loss, if still known to the client
    pub member: Option<Member>,
    pub event_type: CacheEventType,
    pub partition_id: u32,
}

pub trait CachePartitionLostListener: Send + Sync {
    fn partition_lost(&self, event: CachePartitionLostEvent);
}

impl<F> CachePartitionLostListener for F
where
    F: Fn(CachePartitionLostEvent) + Send + Sync,
{
    fn partition_lost(&self, event: CachePartitionLostEvent) {
        self(event)
    }
}

// == Handlers ==
/// Decodes wire entry events and hands them to a typed listener.
pub(crate) struct EntryEventAdaptor<K, V> {
    cache_name: String,
    configuration: CacheEntryListenerConfiguration<K, V>,
    serialization: SerializationService,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> EntryEventAdaptor<K, V>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
{
    pub(crate) fn new(
        cache_name: impl Into<String>,
        configuration: CacheEntryListenerConfiguration<K, V>,
        serialization: SerializationService,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            configuration,
            serialization,
            _marker: PhantomData,
        }
    }

    fn decode(&self, data: EntryEventData) -> Result<CacheEntryEvent<K, V>> {
        let old_value = if self.configuration.old_value_required {
            self.serialization.to_object_opt(data.old_value.as_ref())?
        } else {
            None
        };
        Ok(CacheEntryEvent {
            cache_name: data.cache_name,
            event_type: data.event_type,
            key: self.serialization.to_object(&data.key)?,
            value: self.serialization.to_object_opt(data.value.as_ref())?,
            old_value,
        })
    }
}

impl<K, V> EventHandler for EntryEventAdaptor<K, V>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
{
    fn handle(&self, event: ClusterEvent) {
        let ClusterEvent::Entry(data) = event else {
            return;
        };
        if data.cache_name != self.cache_name
            || !self.configuration.event_types.contains(&data.event_type)
        {
            return;
        }
        match self.decode(data) {
            Ok(event) => self.configuration.listener.on_event(&event),
            Err(err) => warn!(cache = %self.cache_name, error = %err, "dropping undecodable entry event"),
        }
    }
}

/// Resolves the reporting member and notifies a partition-lost listener.
pub(crate) struct PartitionLostAdaptor {
    cache_name: String,
    listener: Arc<dyn CachePartitionLostListener>,
    cluster: Arc<dyn ClusterService>,
}

impl PartitionLostAdaptor {
    pub(crate) fn new(
        cache_name: impl Into<String>,
        listener: Arc<dyn CachePartitionLostListener>,
        cluster: Arc<dyn ClusterService>,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            listener,
            cluster,
        }
    }
}

impl EventHandler for PartitionLostAdaptor {
    fn handle(&self, event: ClusterEvent) {
        if let ClusterEvent::PartitionLost {
            partition_id,
            member_uuid,
        } = event
        {
            self.listener.partition_lost(CachePartitionLostEvent {
                cache_name: self.cache_name.clone(),
                member: self.cluster.member(&member_uuid),
                event_type: CacheEventType::PartitionLost,
                partition_id,
            });
        }
    }
}

/// Drops near-cache records the cluster reports as changed.
pub(crate) struct InvalidationHandler {
    cache_name: String,
    near_cache: NearCache,
}

impl InvalidationHandler {
    pub(crate) fn new(cache_name: impl Into<String>, near_cache: NearCache) -> Self {
        Self {
            cache_name: cache_name.into(),
            near_cache,
        }
    }
}

impl EventHandler for InvalidationHandler {
    fn handle(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::Invalidation { cache_name, key } if cache_name == self.cache_name => {
                match key {
                    Some(key) => {
                        self.near_cache.invalidate(&key);
                    }
                    None => self.near_cache.clear(),
                }
            }
            _ => {}
        }
    }
}
