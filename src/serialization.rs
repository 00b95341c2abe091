//! Serialization Module
//!
//! Converts application keys and values to their opaque wire form and back.
//! Serialized keys double as near-cache index and partition routing key.

use std::fmt;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{CacheError, Result};

// == Data ==
/// Opaque serialized form of a key or value.
///
/// Immutable and cheap to clone. Two `Data` values are equal exactly when
/// their bytes are equal, which is what makes them usable as map keys.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Data(Bytes);

/// Serialized application key.
pub type CacheKey = Data;

impl Data {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) => write!(f, "Data({})", text),
            Err(_) => write!(f, "Data({} bytes)", self.0.len()),
        }
    }
}

// == Serialization Service ==
/// JSON-backed codec between application objects and [`Data`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SerializationService;

impl SerializationService {
    pub fn new() -> Self {
        Self
    }

    /// Serializes an object into its wire form.
    pub fn to_data<T: Serialize + ?Sized>(&self, object: &T) -> Result<Data> {
        let bytes = serde_json::to_vec(object)?;
        Ok(Data::from_bytes(bytes))
    }

    /// Deserializes a wire form back into an object.
    pub fn to_object<T: DeserializeOwned>(&self, data: &Data) -> Result<T> {
        serde_json::from_slice(data.as_bytes()).map_err(|e| {
            CacheError::Serialization(format!("cannot decode {:?}: {}", data, e))
        })
    }

    /// Deserializes an optional wire form, mapping `None` to `None`.
    pub fn to_object_opt<T: DeserializeOwned>(&self, data: Option<&Data>) -> Result<Option<T>> {
        data.map(|d| self.to_object(d)).transpose()
    }
}
