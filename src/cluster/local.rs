//! In-process cluster
//!
//! A partitioned cache cluster living in the current process. It implements
//! every collaborator contract the proxy consumes, so the proxy can be run
//! and tested without a network. Owner of partition `p` is member
//! `p % member_count`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::cluster::{
    Address, ClusterEvent, ClusterService, EntryEventData, EventHandler, Invocation,
    InvocationFuture, InvocationService, InvocationTarget, ListenerService, Member,
    PartitionService,
};
use crate::config::ExpiryPolicy;
use crate::error::RemoteError;
use crate::protocol::{CacheEventType, CacheOperation, CacheRequest, CacheResponse, DataEntry};
use crate::serialization::Data;

/// Server-side cache loader used by load-all.
pub type CacheLoaderFn = Arc<dyn Fn(&Data) -> Result<Option<Data>, String> + Send + Sync>;

type OpResult = Result<CacheResponse, RemoteError>;

// == Storage ==
#[derive(Debug, Clone)]
struct Record {
    value: Data,
    expires_at: Option<Instant>,
}

impl Record {
    fn created(value: Data, expiry: Option<ExpiryPolicy>, now: Instant) -> Self {
        Self {
            value,
            expires_at: expiry.and_then(|p| p.creation).map(|ttl| now + ttl),
        }
    }

    fn update(&mut self, value: Data, expiry: Option<ExpiryPolicy>, now: Instant) -> Data {
        if let Some(ttl) = expiry.and_then(|p| p.update) {
            self.expires_at = Some(now + ttl);
        }
        std::mem::replace(&mut self.value, value)
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

type CacheEntries = BTreeMap<Data, Record>;

#[derive(Debug, Default)]
struct Partition {
    caches: HashMap<String, CacheEntries>,
}

enum Notification {
    Entry(EntryEventData),
    /// Key dropped without an entry event; only near-caches hear of it
    Invalidated(Data),
    Cleared,
}

fn entry_event(
    cache_name: &str,
    event_type: CacheEventType,
    key: &Data,
    value: Option<Data>,
    old_value: Option<Data>,
) -> Notification {
    Notification::Entry(EntryEventData {
        cache_name: cache_name.to_string(),
        event_type,
        key: key.clone(),
        value,
        old_value,
    })
}

/// Returns the live record for `key`, dropping it first if it has expired.
fn live_record<'a>(
    entries: &'a mut CacheEntries,
    key: &Data,
    cache_name: &str,
    now: Instant,
    notes: &mut Vec<Notification>,
) -> Option<&'a mut Record> {
    if entries.get(key).is_some_and(|r| r.is_expired(now)) {
        if let Some(expired) = entries.remove(key) {
            notes.push(entry_event(
                cache_name,
                CacheEventType::Expired,
                key,
                None,
                Some(expired.value),
            ));
        }
        return None;
    }
    entries.get_mut(key)
}

// == Listeners ==
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerKind {
    Entry,
    Invalidation,
    PartitionLost,
}

struct ServerListener {
    cache_name: String,
    kind: ListenerKind,
    handler: Arc<dyn EventHandler>,
}

// == Local Cluster ==
/// Cluster of in-process members sharing one partition table.
pub struct LocalCluster {
    members: Vec<Member>,
    partitions: Vec<Mutex<Partition>>,
    listeners: Mutex<HashMap<String, ServerListener>>,
    member_listener_configs: Mutex<HashMap<Address, HashMap<String, HashSet<Uuid>>>>,
    loader: Mutex<Option<CacheLoaderFn>>,
    unreachable: AtomicBool,
    unreachable_members: Mutex<HashSet<Address>>,
    reject_registrations: AtomicBool,
    invocations: AtomicU64,
}

impl LocalCluster {
    /// Starts `member_count` members over `partition_count` partitions.
    pub fn new(member_count: usize, partition_count: u32) -> Self {
        let members = (0..member_count.max(1))
            .map(|i| Member {
                uuid: Uuid::new_v4(),
                address: Address::new("127.0.0.1", 5701 + i as u16),
            })
            .collect();
        let partitions = (0..partition_count.max(1))
            .map(|_| Mutex::new(Partition::default()))
            .collect();

        Self {
            members,
            partitions,
            listeners: Mutex::new(HashMap::new()),
            member_listener_configs: Mutex::new(HashMap::new()),
            loader: Mutex::new(None),
            unreachable: AtomicBool::new(false),
            unreachable_members: Mutex::new(HashSet::new()),
            reject_registrations: AtomicBool::new(false),
            invocations: AtomicU64::new(0),
        }
    }

    // == Topology ==
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// FNV-1a over the key bytes, modulo the partition count.
    pub fn partition_id(&self, key: &Data) -> u32 {
        let hash = key
            .as_bytes()
            .iter()
            .fold(0x811c_9dc5_u32, |h, b| (h ^ *b as u32).wrapping_mul(0x0100_0193));
        hash % self.partitions.len() as u32
    }

    pub fn owner_of(&self, partition_id: u32) -> &Member {
        &self.members[partition_id as usize % self.members.len()]
    }

    // == Fault Injection ==
    /// Makes every invocation and listener registration fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Makes invocations routed to one member fail.
    pub fn set_member_unreachable(&self, address: &Address, unreachable: bool) {
        let mut members = self.unreachable_members.lock();
        if unreachable {
            members.insert(address.clone());
        } else {
            members.remove(address);
        }
    }

    /// Makes the listener service refuse registrations.
    pub fn set_reject_listener_registrations(&self, reject: bool) {
        self.reject_registrations.store(reject, Ordering::SeqCst);
    }

    pub fn set_loader<F>(&self, loader: F)
    where
        F: Fn(&Data) -> Result<Option<Data>, String> + Send + Sync + 'static,
    {
        *self.loader.lock() = Some(Arc::new(loader));
    }

    // == Inspection ==
    /// Number of invocations received so far.
    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn registered_listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Listener configurations propagated to `address` for `cache_name`.
    pub fn listener_configs_on(&self, address: &Address, cache_name: &str) -> Vec<Uuid> {
        self.member_listener_configs
            .lock()
            .get(address)
            .and_then(|caches| caches.get(cache_name))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    // == Server-side Mutations ==
    /// Writes an entry as another client would, firing the usual events.
    pub fn server_put(&self, cache_name: &str, key: Data, value: Data) -> Result<(), RemoteError> {
        self.execute(CacheRequest::new(
            cache_name,
            CacheOperation::Put {
                key,
                value,
                expiry: None,
                get_old: false,
                if_absent: false,
            },
        ))
        .map(|_| ())
    }

    /// Drops every entry of a partition. Near-caches are told to invalidate
    /// the lost keys, then partition-lost listeners are notified.
    pub fn lose_partition(&self, partition_id: u32) {
        let lost: Vec<(String, CacheEntries)> = match self.partitions.get(partition_id as usize) {
            Some(partition) => partition.lock().caches.drain().collect(),
            None => Vec::new(),
        };
        for (cache_name, entries) in lost {
            debug!(cache = %cache_name, partition_id, keys = entries.len(), "partition lost");
            let notes = entries.into_keys().map(Notification::Invalidated).collect();
            self.publish(&cache_name, notes);
        }
        let owner = self.owner_of(partition_id).uuid;
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .listeners
            .lock()
            .values()
            .filter(|l| l.kind == ListenerKind::PartitionLost)
            .map(|l| l.handler.clone())
            .collect();
        for handler in handlers {
            handler.handle(ClusterEvent::PartitionLost {
                partition_id,
                member_uuid: owner,
            });
        }
    }

    // == Routing ==
    fn route(&self, target: &InvocationTarget) -> Result<(), RemoteError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RemoteError::Transport("cluster unreachable".to_string()));
        }
        let address = match target {
            InvocationTarget::Key(key) => self.owner_of(self.partition_id(key)).address.clone(),
            InvocationTarget::Partition(id) => {
                if *id as usize >= self.partitions.len() {
                    return Err(RemoteError::Server(format!("partition {} does not exist", id)));
                }
                self.owner_of(*id).address.clone()
            }
            InvocationTarget::Member(address) => {
                if !self.members.iter().any(|m| &m.address == address) {
                    return Err(RemoteError::TargetNotMember(address.to_string()));
                }
                address.clone()
            }
            InvocationTarget::Any => return Ok(()),
        };
        if self.unreachable_members.lock().contains(&address) {
            return Err(RemoteError::Transport(format!("member {} unreachable", address)));
        }
        Ok(())
    }

    // == Execution ==
    fn execute(&self, request: CacheRequest) -> OpResult {
        let CacheRequest {
            cache_name,
            operation,
        } = request;
        let mut notes = Vec::new();
        let result = self.apply(&cache_name, operation, &mut notes);
        self.publish(&cache_name, notes);
        result
    }

    fn with_entries<R>(
        &self,
        cache_name: &str,
        partition_id: u32,
        f: impl FnOnce(&mut CacheEntries) -> R,
    ) -> R {
        let mut partition = self.partitions[partition_id as usize].lock();
        let entries = partition.caches.entry(cache_name.to_string()).or_default();
        f(entries)
    }

    fn with_key<R>(
        &self,
        cache_name: &str,
        key: &Data,
        f: impl FnOnce(&mut CacheEntries) -> R,
    ) -> R {
        self.with_entries(cache_name, self.partition_id(key), f)
    }

    fn apply(
        &self,
        cache: &str,
        operation: CacheOperation,
        notes: &mut Vec<Notification>,
    ) -> OpResult {
        let now = Instant::now();
        match operation {
            CacheOperation::Get { key, expiry } => self.with_key(cache, &key, |entries| {
                let value = live_record(entries, &key, cache, now, notes).map(|record| {
                    if let Some(ttl) = expiry.and_then(|p| p.access) {
                        record.expires_at = Some(now + ttl);
                    }
                    record.value.clone()
                });
                Ok(CacheResponse::Value(value))
            }),

            CacheOperation::GetAll { keys, expiry } => {
                let mut found = Vec::new();
                for key in keys {
                    let response = self.apply(cache, CacheOperation::Get { key: key.clone(), expiry }, notes)?;
                    if let CacheResponse::Value(Some(value)) = response {
                        found.push((key, value));
                    }
                }
                Ok(CacheResponse::Entries(found))
            }

            CacheOperation::ContainsKey { key } => self.with_key(cache, &key, |entries| {
                let exists = live_record(entries, &key, cache, now, notes).is_some();
                Ok(CacheResponse::Bool(exists))
            }),

            CacheOperation::Put {
                key,
                value,
                expiry,
                get_old,
                if_absent,
            } => self.with_key(cache, &key, |entries| {
                match live_record(entries, &key, cache, now, notes) {
                    Some(_) if if_absent => Ok(CacheResponse::Bool(false)),
                    Some(record) => {
                        let old = record.update(value.clone(), expiry, now);
                        notes.push(entry_event(
                            cache,
                            CacheEventType::Updated,
                            &key,
                            Some(value),
                            Some(old.clone()),
                        ));
                        Ok(if get_old {
                            CacheResponse::Value(Some(old))
                        } else {
                            CacheResponse::Unit
                        })
                    }
                    None => {
                        entries.insert(key.clone(), Record::created(value.clone(), expiry, now));
                        notes.push(entry_event(cache, CacheEventType::Created, &key, Some(value), None));
                        Ok(if if_absent {
                            CacheResponse::Bool(true)
                        } else if get_old {
                            CacheResponse::Value(None)
                        } else {
                            CacheResponse::Unit
                        })
                    }
                }
            }),

            CacheOperation::Remove {
                key,
                old_value,
                get_old,
            } => self.with_key(cache, &key, |entries| {
                let current = live_record(entries, &key, cache, now, notes).map(|r| r.value.clone());
                let Some(current) = current else {
                    return Ok(if get_old {
                        CacheResponse::Value(None)
                    } else {
                        CacheResponse::Bool(false)
                    });
                };
                if old_value.as_ref().is_some_and(|expected| *expected != current) {
                    return Ok(CacheResponse::Bool(false));
                }
                entries.remove(&key);
                notes.push(entry_event(cache, CacheEventType::Removed, &key, None, Some(current.clone())));
                Ok(if get_old {
                    CacheResponse::Value(Some(current))
                } else {
                    CacheResponse::Bool(true)
                })
            }),

            CacheOperation::Replace {
                key,
                old_value,
                new_value,
                expiry,
                get_old,
            } => self.with_key(cache, &key, |entries| {
                let Some(record) = live_record(entries, &key, cache, now, notes) else {
                    return Ok(if get_old {
                        CacheResponse::Value(None)
                    } else {
                        CacheResponse::Bool(false)
                    });
                };
                if old_value.as_ref().is_some_and(|expected| *expected != record.value) {
                    return Ok(CacheResponse::Bool(false));
                }
                let old = record.update(new_value.clone(), expiry, now);
                notes.push(entry_event(
                    cache,
                    CacheEventType::Updated,
                    &key,
                    Some(new_value),
                    Some(old.clone()),
                ));
                Ok(if get_old {
                    CacheResponse::Value(Some(old))
                } else {
                    CacheResponse::Bool(true)
                })
            }),

            CacheOperation::RemoveAll { keys: Some(keys) } => {
                let mut removed = 0;
                for key in keys {
                    let op = CacheOperation::Remove {
                        key,
                        old_value: None,
                        get_old: false,
                    };
                    if self.apply(cache, op, notes)? == CacheResponse::Bool(true) {
                        removed += 1;
                    }
                }
                Ok(CacheResponse::Count(removed))
            }

            CacheOperation::RemoveAll { keys: None } => {
                let mut removed = 0;
                for partition_id in 0..self.partitions.len() as u32 {
                    self.with_entries(cache, partition_id, |entries| {
                        for (key, record) in std::mem::take(entries) {
                            let event_type = if record.is_expired(now) {
                                CacheEventType::Expired
                            } else {
                                removed += 1;
                                CacheEventType::Removed
                            };
                            notes.push(entry_event(cache, event_type, &key, None, Some(record.value)));
                        }
                    });
                }
                Ok(CacheResponse::Count(removed))
            }

            CacheOperation::Clear => {
                for partition in &self.partitions {
                    partition.lock().caches.remove(cache);
                }
                notes.push(Notification::Cleared);
                Ok(CacheResponse::Unit)
            }

            CacheOperation::Size => {
                let size = self
                    .partitions
                    .iter()
                    .map(|p| {
                        p.lock()
                            .caches
                            .get(cache)
                            .map_or(0, |entries| entries.values().filter(|r| !r.is_expired(now)).count())
                    })
                    .sum::<usize>();
                Ok(CacheResponse::Count(size as u64))
            }

            CacheOperation::LoadAll {
                keys,
                replace_existing,
            } => {
                let loader = self.loader.lock().clone().ok_or_else(|| {
                    RemoteError::Loader(format!("no cache loader configured for {}", cache))
                })?;
                for key in keys {
                    let exists = self.with_key(cache, &key, |entries| {
                        live_record(entries, &key, cache, now, notes).is_some()
                    });
                    if exists && !replace_existing {
                        continue;
                    }
                    if let Some(value) = loader(&key).map_err(RemoteError::Loader)? {
                        let op = CacheOperation::Put {
                            key,
                            value,
                            expiry: None,
                            get_old: false,
                            if_absent: false,
                        };
                        self.apply(cache, op, notes)?;
                    }
                }
                Ok(CacheResponse::Unit)
            }

            CacheOperation::EntryProcessor {
                key,
                processor,
                arguments,
            } => self.with_key(cache, &key, |entries| {
                let before = live_record(entries, &key, cache, now, notes).map(|r| r.value.clone());
                let mut entry = DataEntry {
                    key: key.clone(),
                    value: before.clone(),
                };
                let result = processor
                    .process(&mut entry, &arguments)
                    .map_err(RemoteError::Processor)?;

                if entry.value != before {
                    match entry.value {
                        Some(value) => {
                            let event_type = if before.is_some() {
                                CacheEventType::Updated
                            } else {
                                CacheEventType::Created
                            };
                            match entries.get_mut(&key) {
                                Some(record) => {
                                    record.update(value.clone(), None, now);
                                }
                                None => {
                                    entries.insert(key.clone(), Record::created(value.clone(), None, now));
                                }
                            }
                            notes.push(entry_event(cache, event_type, &key, Some(value), before));
                        }
                        None => {
                            entries.remove(&key);
                            notes.push(entry_event(cache, CacheEventType::Removed, &key, None, before));
                        }
                    }
                }
                Ok(CacheResponse::Value(result))
            }),

            CacheOperation::Iterate {
                partition_id,
                after,
                batch_size,
            } => {
                if partition_id as usize >= self.partitions.len() {
                    return Err(RemoteError::Server(format!(
                        "partition {} does not exist",
                        partition_id
                    )));
                }
                if batch_size == 0 {
                    return Err(RemoteError::Server("batch size must be positive".to_string()));
                }
                self.with_entries(cache, partition_id, |entries| {
                    let lower = match &after {
                        Some(key) => Bound::Excluded(key),
                        None => Bound::Unbounded,
                    };
                    let mut batch = Vec::new();
                    let mut exhausted = true;
                    for (key, record) in entries
                        .range::<Data, _>((lower, Bound::Unbounded))
                        .filter(|(_, r)| !r.is_expired(now))
                    {
                        if batch.len() == batch_size {
                            exhausted = false;
                            break;
                        }
                        batch.push((key.clone(), record.value.clone()));
                    }
                    Ok(CacheResponse::IterationBatch {
                        entries: batch,
                        exhausted,
                    })
                })
            }

            CacheOperation::ListenerRegistration {
                listener,
                register,
                address,
            } => {
                let mut configs = self.member_listener_configs.lock();
                let ids = configs
                    .entry(address)
                    .or_default()
                    .entry(cache.to_string())
                    .or_default();
                if register {
                    ids.insert(listener.id);
                } else {
                    ids.remove(&listener.id);
                }
                Ok(CacheResponse::Unit)
            }

            other @ (CacheOperation::AddEntryListener
            | CacheOperation::RemoveEntryListener
            | CacheOperation::AddInvalidationListener
            | CacheOperation::RemoveInvalidationListener
            | CacheOperation::AddPartitionLostListener
            | CacheOperation::RemovePartitionLostListener) => Err(RemoteError::Server(format!(
                "{} is handled by the listener service",
                other.kind()
            ))),
        }
    }

    // == Event Publication ==
    fn publish(&self, cache_name: &str, notes: Vec<Notification>) {
        if notes.is_empty() {
            return;
        }
        let targets: Vec<(ListenerKind, Arc<dyn EventHandler>)> = self
            .listeners
            .lock()
            .values()
            .filter(|l| l.cache_name == cache_name && l.kind != ListenerKind::PartitionLost)
            .map(|l| (l.kind, l.handler.clone()))
            .collect();

        for note in notes {
            for (kind, handler) in &targets {
                match (kind, &note) {
                    (ListenerKind::Entry, Notification::Entry(event)) => {
                        handler.handle(ClusterEvent::Entry(event.clone()));
                    }
                    (ListenerKind::Invalidation, Notification::Entry(event)) => {
                        handler.handle(ClusterEvent::Invalidation {
                            cache_name: cache_name.to_string(),
                            key: Some(event.key.clone()),
                        });
                    }
                    (ListenerKind::Invalidation, Notification::Invalidated(key)) => {
                        handler.handle(ClusterEvent::Invalidation {
                            cache_name: cache_name.to_string(),
                            key: Some(key.clone()),
                        });
                    }
                    (ListenerKind::Invalidation, Notification::Cleared) => {
                        handler.handle(ClusterEvent::Invalidation {
                            cache_name: cache_name.to_string(),
                            key: None,
                        });
                    }
                    _ => {}
                }
            }
        }
    }
}

impl InvocationService for LocalCluster {
    fn invoke(&self, invocation: Invocation) -> InvocationFuture {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        debug!(
            request_id = invocation.request_id,
            operation = invocation.request.kind(),
            "local cluster executing invocation"
        );
        let result = self
            .route(&invocation.target)
            .and_then(|()| self.execute(invocation.request));
        futures::future::ready(result).boxed()
    }
}

impl ClusterService for LocalCluster {
    fn member_list(&self) -> Vec<Member> {
        self.members.clone()
    }

    fn member(&self, uuid: &Uuid) -> Option<Member> {
        self.members.iter().find(|m| &m.uuid == uuid).cloned()
    }
}

impl PartitionService for LocalCluster {
    fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }
}

#[async_trait]
impl ListenerService for LocalCluster {
    async fn register_listener(
        &self,
        add_request: CacheRequest,
        _remove_request: CacheRequest,
        handler: Arc<dyn EventHandler>,
    ) -> Option<String> {
        if self.unreachable.load(Ordering::SeqCst) || self.reject_registrations.load(Ordering::SeqCst) {
            return None;
        }
        let kind = match add_request.operation {
            CacheOperation::AddEntryListener => ListenerKind::Entry,
            CacheOperation::AddInvalidationListener => ListenerKind::Invalidation,
            CacheOperation::AddPartitionLostListener => ListenerKind::PartitionLost,
            _ => return None,
        };

        handler.before_listener_register();
        let id = Uuid::new_v4().to_string();
        self.listeners.lock().insert(
            id.clone(),
            ServerListener {
                cache_name: add_request.cache_name,
                kind,
                handler: handler.clone(),
            },
        );
        handler.on_listener_register();
        Some(id)
    }

    async fn deregister_listener(&self, registration_id: &str) -> bool {
        if self.unreachable.load(Ordering::SeqCst) {
            return false;
        }
        self.listeners.lock().remove(registration_id).is_some()
    }
}
