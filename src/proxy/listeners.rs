//! Listener Registry
//!
//! Single owner of a proxy's listener bookkeeping. Registration with the
//! listener service is authoritative; propagation of entry listener
//! configurations to the members is best-effort and never fails a call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cluster::{ClusterService, EventHandler, ListenerService};
use crate::error::{CacheError, Result};
use crate::protocol::{CacheOperation, CacheRequest, EntryListenerDescriptor};
use crate::proxy::dispatcher::InvocationDispatcher;

#[derive(Debug, Clone)]
struct EntryRegistration {
    registration_id: String,
    descriptor: EntryListenerDescriptor,
}

/// Listener registrations of one cache proxy.
pub struct ListenerRegistry {
    cache_name: String,
    listeners: Arc<dyn ListenerService>,
    cluster: Arc<dyn ClusterService>,
    dispatcher: InvocationDispatcher,
    entries: Mutex<HashMap<Uuid, EntryRegistration>>,
    partition_lost: Mutex<HashSet<String>>,
    invalidation: Mutex<Option<String>>,
    fan_out: Mutex<Vec<JoinHandle<()>>>,
}

impl ListenerRegistry {
    pub fn new(
        cache_name: impl Into<String>,
        listeners: Arc<dyn ListenerService>,
        cluster: Arc<dyn ClusterService>,
        dispatcher: InvocationDispatcher,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            listeners,
            cluster,
            dispatcher,
            entries: Mutex::new(HashMap::new()),
            partition_lost: Mutex::new(HashSet::new()),
            invalidation: Mutex::new(None),
            fan_out: Mutex::new(Vec::new()),
        }
    }

    fn request(&self, operation: CacheOperation) -> CacheRequest {
        CacheRequest::new(self.cache_name.clone(), operation)
    }

    // == Entry Listeners ==
    /// Registers an entry listener configuration and propagates it to every
    /// member. Registering a configuration that is already registered returns
    /// the existing registration id.
    pub async fn register_entry_listener(
        &self,
        descriptor: EntryListenerDescriptor,
        handler: Arc<dyn EventHandler>,
    ) -> Result<String> {
        if let Some(existing) = self.entries.lock().get(&descriptor.id) {
            return Ok(existing.registration_id.clone());
        }

        let registration_id = self
            .listeners
            .register_listener(
                self.request(CacheOperation::AddEntryListener),
                self.request(CacheOperation::RemoveEntryListener),
                handler,
            )
            .await
            .ok_or_else(|| {
                CacheError::RemoteInvocation(format!(
                    "entry listener registration refused for cache {}",
                    self.cache_name
                ))
            })?;

        let winner = {
            let mut entries = self.entries.lock();
            match entries.get(&descriptor.id) {
                Some(existing) => Some(existing.registration_id.clone()),
                None => {
                    entries.insert(
                        descriptor.id,
                        EntryRegistration {
                            registration_id: registration_id.clone(),
                            descriptor: descriptor.clone(),
                        },
                    );
                    None
                }
            }
        };
        if let Some(winner) = winner {
            // Lost a concurrent registration of the same configuration
            self.listeners.deregister_listener(&registration_id).await;
            return Ok(winner);
        }

        info!(
            cache = %self.cache_name,
            listener = %descriptor.id,
            registration_id = %registration_id,
            "entry listener registered"
        );
        self.update_on_other_nodes(descriptor, true).await;
        Ok(registration_id)
    }

    /// Deregisters an entry listener configuration. Returns false when it was
    /// not registered or the listener service did not confirm the removal.
    pub async fn deregister_entry_listener(&self, listener_id: Uuid) -> bool {
        let Some(registration) = self.entries.lock().get(&listener_id).cloned() else {
            return false;
        };
        if !self
            .listeners
            .deregister_listener(&registration.registration_id)
            .await
        {
            warn!(
                cache = %self.cache_name,
                listener = %listener_id,
                "listener service did not confirm deregistration"
            );
            return false;
        }

        {
            let mut entries = self.entries.lock();
            if entries
                .get(&listener_id)
                .is_some_and(|r| r.registration_id == registration.registration_id)
            {
                entries.remove(&listener_id);
            }
        }
        info!(cache = %self.cache_name, listener = %listener_id, "entry listener deregistered");
        self.update_on_other_nodes(registration.descriptor, false).await;
        true
    }

    /// Sends a listener configuration change to every known member. On a
    /// tokio runtime the replies are collected in a background task; on any
    /// other executor they are awaited in place.
    pub async fn update_on_other_nodes(&self, descriptor: EntryListenerDescriptor, register: bool) {
        let futures: Vec<_> = self
            .cluster
            .member_list()
            .into_iter()
            .map(|member| {
                let address = member.address.clone();
                let request = self.request(CacheOperation::ListenerRegistration {
                    listener: descriptor.clone(),
                    register,
                    address: address.clone(),
                });
                let future = self.dispatcher.invoke_on_member(request, address.clone());
                async move { (address, future.await) }
            })
            .collect();
        if futures.is_empty() {
            return;
        }

        let cache_name = self.cache_name.clone();
        let listener_id = descriptor.id;
        let propagation = async move {
            for (address, result) in join_all(futures).await {
                if let Err(err) = result {
                    warn!(
                        cache = %cache_name,
                        listener = %listener_id,
                        member = %address,
                        error = %err,
                        "listener configuration not propagated"
                    );
                }
            }
        };

        match Handle::try_current().ok() {
            Some(runtime) => {
                let handle = runtime.spawn(propagation);
                let mut fan_out = self.fan_out.lock();
                fan_out.retain(|h| !h.is_finished());
                fan_out.push(handle);
            }
            None => propagation.await,
        }
    }

    /// Waits for every outstanding member propagation to finish.
    pub async fn drain_propagation(&self) {
        let handles = std::mem::take(&mut *self.fan_out.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(cache = %self.cache_name, error = %err, "listener propagation task failed");
            }
        }
    }

    pub fn is_registered(&self, listener_id: Uuid) -> bool {
        self.entries.lock().contains_key(&listener_id)
    }

    /// Registered entry listener configurations.
    pub fn descriptors(&self) -> Vec<EntryListenerDescriptor> {
        self.entries
            .lock()
            .values()
            .map(|r| r.descriptor.clone())
            .collect()
    }

    // == Partition Lost Listeners ==
    pub async fn register_partition_lost(&self, handler: Arc<dyn EventHandler>) -> Result<String> {
        let registration_id = self
            .listeners
            .register_listener(
                self.request(CacheOperation::AddPartitionLostListener),
                self.request(CacheOperation::RemovePartitionLostListener),
                handler,
            )
            .await
            .ok_or_else(|| {
                CacheError::RemoteInvocation(format!(
                    "partition lost listener registration refused for cache {}",
                    self.cache_name
                ))
            })?;
        self.partition_lost.lock().insert(registration_id.clone());
        Ok(registration_id)
    }

    pub async fn deregister_partition_lost(&self, registration_id: &str) -> bool {
        let removed = self.listeners.deregister_listener(registration_id).await;
        if removed {
            self.partition_lost.lock().remove(registration_id);
        }
        removed
    }

    // == Near-cache Invalidation ==
    /// Subscribes to invalidations of this cache. Returns false if the
    /// listener service refused.
    pub async fn register_invalidation(&self, handler: Arc<dyn EventHandler>) -> bool {
        let registration_id = self
            .listeners
            .register_listener(
                self.request(CacheOperation::AddInvalidationListener),
                self.request(CacheOperation::RemoveInvalidationListener),
                handler,
            )
            .await;
        let registered = registration_id.is_some();
        *self.invalidation.lock() = registration_id;
        registered
    }

    /// Removes every registration this registry holds, best-effort.
    pub async fn deregister_all(&self) {
        let listener_ids: Vec<Uuid> = self.entries.lock().keys().copied().collect();
        for listener_id in listener_ids {
            self.deregister_entry_listener(listener_id).await;
        }

        let partition_lost: Vec<String> = self.partition_lost.lock().drain().collect();
        for registration_id in partition_lost {
            self.listeners.deregister_listener(&registration_id).await;
        }

        let invalidation = self.invalidation.lock().take();
        if let Some(registration_id) = invalidation {
            self.listeners.deregister_listener(&registration_id).await;
        }
    }
}
