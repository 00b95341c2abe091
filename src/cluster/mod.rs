//! Cluster Module
//!
//! Contracts of the collaborators the proxy sits on: the invocation layer,
//! the cluster and partition views, and the listener service. The proxy
//! only consumes these; `local` provides an in-process implementation.

pub mod local;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RemoteError;
use crate::protocol::{CacheEventType, CacheRequest, CacheResponse};
use crate::serialization::{Data, SerializationService};

pub use local::LocalCluster;

// == Members ==
/// Network address of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub uuid: Uuid,
    pub address: Address,
}

// == Invocation ==
/// Where an invocation is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationTarget {
    /// Owner of the partition the key belongs to
    Key(Data),
    /// Owner of a partition
    Partition(u32),
    /// A specific member
    Member(Address),
    /// Any member; for cluster-wide operations
    Any,
}

/// One outbound request.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub request_id: u64,
    pub request: CacheRequest,
    pub target: InvocationTarget,
    /// Route straight to the owner instead of through any connected member
    pub smart_routing: bool,
}

/// Completes once with the decoded response or the failure.
pub type InvocationFuture = BoxFuture<'static, Result<CacheResponse, RemoteError>>;

/// Transport/invocation layer. Retries, if any, happen behind this trait.
pub trait InvocationService: Send + Sync {
    fn invoke(&self, invocation: Invocation) -> InvocationFuture;
}

/// Current view of the cluster membership.
pub trait ClusterService: Send + Sync {
    fn member_list(&self) -> Vec<Member>;

    fn member(&self, uuid: &Uuid) -> Option<Member>;
}

/// Partition table view.
pub trait PartitionService: Send + Sync {
    fn partition_count(&self) -> u32;
}

// == Events ==
/// Entry mutation delivered by the cluster in wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryEventData {
    pub cache_name: String,
    pub event_type: CacheEventType,
    pub key: Data,
    pub value: Option<Data>,
    pub old_value: Option<Data>,
}

/// Events the cluster pushes to registered handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    Entry(EntryEventData),
    /// A key changed (`Some`) or the whole cache was cleared (`None`)
    Invalidation {
        cache_name: String,
        key: Option<Data>,
    },
    PartitionLost {
        partition_id: u32,
        member_uuid: Uuid,
    },
}

/// Receives events for one listener registration.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: ClusterEvent);

    fn before_listener_register(&self) {}

    fn on_listener_register(&self) {}
}

/// Registers event handlers with the cluster.
#[async_trait]
pub trait ListenerService: Send + Sync {
    /// Returns the registration id, or `None` if the cluster refused it.
    async fn register_listener(
        &self,
        add_request: CacheRequest,
        remove_request: CacheRequest,
        handler: Arc<dyn EventHandler>,
    ) -> Option<String>;

    /// Returns true if a registration with this id existed and was removed.
    async fn deregister_listener(&self, registration_id: &str) -> bool;
}

// == Client Context ==
/// Collaborators shared by every proxy of one client.
#[derive(Clone)]
pub struct ClientContext {
    pub invocation: Arc<dyn InvocationService>,
    pub cluster: Arc<dyn ClusterService>,
    pub partitions: Arc<dyn PartitionService>,
    pub listeners: Arc<dyn ListenerService>,
    pub serialization: SerializationService,
}

impl ClientContext {
    /// Context whose collaborators are all the same object.
    pub fn from_service<S>(service: Arc<S>) -> Self
    where
        S: InvocationService + ClusterService + PartitionService + ListenerService + 'static,
    {
        Self {
            invocation: service.clone(),
            cluster: service.clone(),
            partitions: service.clone(),
            listeners: service,
            serialization: SerializationService::new(),
        }
    }
}

impl fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientContext")
            .field("members", &self.cluster.member_list().len())
            .field("partitions", &self.partitions.partition_count())
            .finish_non_exhaustive()
    }
}
