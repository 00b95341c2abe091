//! Protocol Module
//!
//! Operation descriptors exchanged between the proxy and the invocation
//! layer. Each cache operation is one `CacheOperation` variant carrying its
//! payload; variants that share a shape (remove, replace, put) are
//! parameterized by flags instead of being separate request types.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::Address;
use crate::config::ExpiryPolicy;
use crate::error::RemoteError;
use crate::serialization::Data;

// == Event Types ==
/// Kinds of cache events delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheEventType {
    Created,
    Updated,
    Removed,
    Expired,
    PartitionLost,
}

/// Wire description of an entry listener configuration.
///
/// `id` is the identity of the configuration: clones of one configuration
/// share it, independently created configurations never do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryListenerDescriptor {
    pub id: Uuid,
    pub event_types: Vec<CacheEventType>,
    pub old_value_required: bool,
    pub synchronous: bool,
}

// == Entry Processing ==
/// Entry state handed to a processor on the partition owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEntry {
    pub key: Data,
    pub value: Option<Data>,
}

/// Processor in wire form, executed by the partition owner.
///
/// Returns the serialized result, `None` for a null result, or the message
/// the processor failed with.
pub trait DataEntryProcessor: Send + Sync {
    fn process(
        &self,
        entry: &mut DataEntry,
        arguments: &[Data],
    ) -> std::result::Result<Option<Data>, String>;
}

// == Cache Operation ==
/// One logical cache operation and its payload.
#[derive(Clone)]
pub enum CacheOperation {
    Get {
        key: Data,
        expiry: Option<ExpiryPolicy>,
    },
    GetAll {
        keys: Vec<Data>,
        expiry: Option<ExpiryPolicy>,
    },
    ContainsKey {
        key: Data,
    },
    Put {
        key: Data,
        value: Data,
        expiry: Option<ExpiryPolicy>,
        /// Respond with the previous value
        get_old: bool,
        /// Only store when the key is absent; respond with a boolean
        if_absent: bool,
    },
    Remove {
        key: Data,
        /// Only remove when the current value equals this one
        old_value: Option<Data>,
        /// Respond with the removed value instead of a boolean
        get_old: bool,
    },
    Replace {
        key: Data,
        /// Only replace when the current value equals this one
        old_value: Option<Data>,
        new_value: Data,
        expiry: Option<ExpiryPolicy>,
        /// Respond with the replaced value instead of a boolean
        get_old: bool,
    },
    /// `keys == None` removes every entry
    RemoveAll {
        keys: Option<Vec<Data>>,
    },
    Clear,
    Size,
    LoadAll {
        keys: Vec<Data>,
        replace_existing: bool,
    },
    EntryProcessor {
        key: Data,
        processor: Arc<dyn DataEntryProcessor>,
        arguments: Vec<Data>,
    },
    /// Next batch of a partition, starting after `after`
    Iterate {
        partition_id: u32,
        after: Option<Data>,
        batch_size: usize,
    },
    /// Propagates a listener configuration change to one member
    ListenerRegistration {
        listener: EntryListenerDescriptor,
        register: bool,
        address: Address,
    },
    AddEntryListener,
    RemoveEntryListener,
    AddInvalidationListener,
    RemoveInvalidationListener,
    AddPartitionLostListener,
    RemovePartitionLostListener,
}

impl CacheOperation {
    /// Short operation name for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            CacheOperation::Get { .. } => "get",
            CacheOperation::GetAll { .. } => "get_all",
            CacheOperation::ContainsKey { .. } => "contains_key",
            CacheOperation::Put { if_absent: true, .. } => "put_if_absent",
            CacheOperation::Put { get_old: true, .. } => "get_and_put",
            CacheOperation::Put { .. } => "put",
            CacheOperation::Remove { get_old: true, .. } => "get_and_remove",
            CacheOperation::Remove { .. } => "remove",
            CacheOperation::Replace { get_old: true, .. } => "get_and_replace",
            CacheOperation::Replace { .. } => "replace",
            CacheOperation::RemoveAll { .. } => "remove_all",
            CacheOperation::Clear => "clear",
            CacheOperation::Size => "size",
            CacheOperation::LoadAll { .. } => "load_all",
            CacheOperation::EntryProcessor { .. } => "entry_processor",
            CacheOperation::Iterate { .. } => "iterate",
            CacheOperation::ListenerRegistration { .. } => "listener_registration",
            CacheOperation::AddEntryListener => "add_entry_listener",
            CacheOperation::RemoveEntryListener => "remove_entry_listener",
            CacheOperation::AddInvalidationListener => "add_invalidation_listener",
            CacheOperation::RemoveInvalidationListener => "remove_invalidation_listener",
            CacheOperation::AddPartitionLostListener => "add_partition_lost_listener",
            CacheOperation::RemovePartitionLostListener => "remove_partition_lost_listener",
        }
    }
}

impl fmt::Debug for CacheOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

// == Cache Request ==
/// An operation addressed to a named cache.
#[derive(Debug, Clone)]
pub struct CacheRequest {
    pub cache_name: String,
    pub operation: CacheOperation,
}

impl CacheRequest {
    pub fn new(cache_name: impl Into<String>, operation: CacheOperation) -> Self {
        Self {
            cache_name: cache_name.into(),
            operation,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.operation.kind()
    }
}

// == Cache Response ==
/// Decoded result of an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheResponse {
    Unit,
    Bool(bool),
    Value(Option<Data>),
    Entries(Vec<(Data, Data)>),
    Count(u64),
    IterationBatch {
        entries: Vec<(Data, Data)>,
        /// No entries remain in the partition after this batch
        exhausted: bool,
    },
}

impl CacheResponse {
    fn unexpected(self, operation: &'static str) -> RemoteError {
        RemoteError::UnexpectedResponse {
            operation,
            response: format!("{:?}", self),
        }
    }

    pub fn into_unit(self, operation: &'static str) -> Result<(), RemoteError> {
        match self {
            CacheResponse::Unit => Ok(()),
            other => Err(other.unexpected(operation)),
        }
    }

    pub fn into_bool(self, operation: &'static str) -> Result<bool, RemoteError> {
        match self {
            CacheResponse::Bool(b) => Ok(b),
            other => Err(other.unexpected(operation)),
        }
    }

    pub fn into_value(self, operation: &'static str) -> Result<Option<Data>, RemoteError> {
        match self {
            CacheResponse::Value(v) => Ok(v),
            other => Err(other.unexpected(operation)),
        }
    }

    pub fn into_entries(self, operation: &'static str) -> Result<Vec<(Data, Data)>, RemoteError> {
        match self {
            CacheResponse::Entries(entries) => Ok(entries),
            other => Err(other.unexpected(operation)),
        }
    }

    pub fn into_count(self, operation: &'static str) -> Result<u64, RemoteError> {
        match self {
            CacheResponse::Count(n) => Ok(n),
            other => Err(other.unexpected(operation)),
        }
    }

    pub fn into_batch(
        self,
        operation: &'static str,
    ) -> Result<(Vec<(Data, Data)>, bool), RemoteError> {
        match self {
            CacheResponse::IterationBatch { entries, exhausted } => Ok((entries, exhausted)),
            other => Err(other.unexpected(operation)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Data {
        Data::from_bytes(&b"k"[..])
    }

    #[test]
    fn test_remove_variants_share_one_operation() {
        let plain = CacheOperation::Remove {
            key: key(),
            old_value: None,
            get_old: false,
        };
        let returning = CacheOperation::Remove {
            key: key(),
            old_value: None,
            get_old: true,
        };
        assert_eq!(plain.kind(), "remove");
        assert_eq!(returning.kind(), "get_and_remove");
    }

    #[test]
    fn test_put_kinds() {
        let put = |get_old, if_absent| CacheOperation::Put {
            key: key(),
            value: key(),
            expiry: None,
            get_old,
            if_absent,
        };
        assert_eq!(put(false, false).kind(), "put");
        assert_eq!(put(true, false).kind(), "get_and_put");
        assert_eq!(put(false, true).kind(), "put_if_absent");
    }

    #[test]
    fn test_unexpected_response_is_reported() {
        let err = CacheResponse::Unit.into_bool("contains_key").unwrap_err();
        assert!(matches!(
            err,
            RemoteError::UnexpectedResponse { operation: "contains_key", .. }
        ));
    }
}
