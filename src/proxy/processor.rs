//! Entry processors
//!
//! Typed processors run against a single entry on the partition owner. The
//! proxy wraps them into a [`DataEntryProcessor`] that works on wire data.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::error::CacheError;
use crate::protocol::{DataEntry, DataEntryProcessor};
use crate::serialization::{Data, SerializationService};

/// Failure raised by a processor while it runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ProcessorError(pub String);

impl ProcessorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<CacheError> for ProcessorError {
    fn from(err: CacheError) -> Self {
        Self(err.to_string())
    }
}

/// Per-key outcome of `invoke_all`.
pub type EntryProcessorResult<T> = Result<T, CacheError>;

// == Mutable Entry ==
/// The entry a processor sees. Changes are written back after `process`.
#[derive(Debug, Clone, PartialEq)]
pub struct MutableEntry<K, V> {
    key: K,
    value: Option<V>,
    changed: bool,
}

impl<K, V> MutableEntry<K, V> {
    pub fn new(key: K, value: Option<V>) -> Self {
        Self {
            key,
            value,
            changed: false,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn exists(&self) -> bool {
        self.value.is_some()
    }

    pub fn set_value(&mut self, value: V) {
        self.value = Some(value);
        self.changed = true;
    }

    pub fn remove(&mut self) {
        self.value = None;
        self.changed = true;
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }
}

/// Arguments shipped alongside a processor, in wire form.
#[derive(Debug, Clone, Default)]
pub struct ProcessorArguments {
    arguments: Vec<Data>,
    serialization: SerializationService,
}

impl ProcessorArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(arguments: Vec<Data>) -> Self {
        Self {
            arguments,
            serialization: SerializationService::new(),
        }
    }

    /// Appends an argument.
    pub fn with<T: Serialize + ?Sized>(mut self, argument: &T) -> Result<Self, CacheError> {
        self.arguments.push(self.serialization.to_data(argument)?);
        Ok(self)
    }

    /// Decodes argument `index`.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, ProcessorError> {
        let data = self
            .arguments
            .get(index)
            .ok_or_else(|| ProcessorError(format!("missing argument {}", index)))?;
        Ok(self.serialization.to_object(data)?)
    }

    pub fn len(&self) -> usize {
        self.arguments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arguments.is_empty()
    }

    pub(crate) fn into_data(self) -> Vec<Data> {
        self.arguments
    }
}

// == Entry Processor ==
/// Logic executed on the owner of one key's partition.
pub trait EntryProcessor<K, V>: Send + Sync + 'static {
    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn process(
        &self,
        entry: &mut MutableEntry<K, V>,
        arguments: &ProcessorArguments,
    ) -> Result<Self::Output, ProcessorError>;
}

/// Runs a typed processor against wire-form entries.
pub(crate) struct ProcessorAdapter<K, V, P> {
    processor: Arc<P>,
    serialization: SerializationService,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, P> ProcessorAdapter<K, V, P> {
    pub(crate) fn new(processor: Arc<P>, serialization: SerializationService) -> Self {
        Self {
            processor,
            serialization,
            _marker: PhantomData,
        }
    }
}

impl<K, V, P> ProcessorAdapter<K, V, P>
where
    K: DeserializeOwned,
    V: Serialize + DeserializeOwned,
    P: EntryProcessor<K, V>,
{
    fn run(&self, entry: &mut DataEntry, arguments: &[Data]) -> Result<Option<Data>, ProcessorError> {
        let ss = self.serialization;
        let mut typed = MutableEntry::new(
            ss.to_object::<K>(&entry.key)?,
            ss.to_object_opt::<V>(entry.value.as_ref())?,
        );
        let output = self
            .processor
            .process(&mut typed, &ProcessorArguments::from_data(arguments.to_vec()))?;

        if typed.changed {
            entry.value = typed.value.as_ref().map(|v| ss.to_data(v)).transpose()?;
        }
        let output = ss.to_data(&output)?;
        Ok((output.as_bytes() != &b"null"[..]).then_some(output))
    }
}

impl<K, V, P> DataEntryProcessor for ProcessorAdapter<K, V, P>
where
    K: DeserializeOwned,
    V: Serialize + DeserializeOwned,
    P: EntryProcessor<K, V>,
{
    fn process(&self, entry: &mut DataEntry, arguments: &[Data]) -> Result<Option<Data>, String> {
        self.run(entry, arguments).map_err(|e| e.0)
    }
}
