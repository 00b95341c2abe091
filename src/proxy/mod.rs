//! Proxy Module
//!
//! The client-side cache proxy and the pieces it is composed of.

pub mod cache_proxy;
pub mod dispatcher;
pub mod events;
pub mod iterator;
pub mod listeners;
pub mod processor;

pub use cache_proxy::{
    CacheConfigurationView, CacheFuture, CacheProxy, CacheType, CompletionListener,
};
pub use dispatcher::{InvocationDispatcher, PendingInvocation};
pub use events::{
    CacheEntryEvent, CacheEntryListener, CacheEntryListenerConfiguration,
    CachePartitionLostEvent, CachePartitionLostListener,
};
pub use iterator::{CacheEntry, ClusterWideIterator, DEFAULT_BATCH_SIZE};
pub use listeners::ListenerRegistry;
pub use processor::{
    EntryProcessor, EntryProcessorResult, MutableEntry, ProcessorArguments, ProcessorError,
};
