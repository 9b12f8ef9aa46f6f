//! Key and value serializers applied before records reach the client.

use crate::{Error, Result};
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;

/// Converts a typed key or value into the bytes handed to the client.
pub trait Serializer<T>: Send + Sync {
    /// Serialize `data` destined for `topic`.
    ///
    /// # Errors
    /// Returns [`Error::Serialization`] if the value cannot be encoded.
    fn serialize(&self, topic: &str, data: &T) -> Result<Bytes>;
}

impl<T, F> Serializer<T> for F
where
    F: Fn(&str, &T) -> Result<Bytes> + Send + Sync,
{
    fn serialize(&self, topic: &str, data: &T) -> Result<Bytes> {
        self(topic, data)
    }
}

/// UTF-8 string serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn serialize(&self, _topic: &str, data: &String) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(data.as_bytes()))
    }
}

impl Serializer<&'static str> for StringSerializer {
    fn serialize(&self, _topic: &str, data: &&'static str) -> Result<Bytes> {
        Ok(Bytes::from_static(data.as_bytes()))
    }
}

/// Pass-through serializer for pre-encoded payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl Serializer<Bytes> for BytesSerializer {
    fn serialize(&self, _topic: &str, data: &Bytes) -> Result<Bytes> {
        Ok(data.clone())
    }
}

impl Serializer<Vec<u8>> for BytesSerializer {
    fn serialize(&self, _topic: &str, data: &Vec<u8>) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }
}

/// Four byte big-endian integer serializer, wire compatible with Kafka's.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerSerializer;

impl Serializer<i32> for IntegerSerializer {
    fn serialize(&self, _topic: &str, data: &i32) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(&data.to_be_bytes()))
    }
}

/// JSON serializer for any `serde::Serialize` type.
pub struct JsonSerializer<T> {
    _marker: PhantomData<fn(&T)>,
}

impl<T> JsonSerializer<T> {
    /// Create a JSON serializer.
    #[must_use]
    pub const fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonSerializer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonSerializer")
    }
}

impl<T: Serialize> Serializer<T> for JsonSerializer<T> {
    fn serialize(&self, topic: &str, data: &T) -> Result<Bytes> {
        serde_json::to_vec(data).map(Bytes::from).map_err(|e| {
            Error::serialization(format!("Failed to encode JSON for topic {topic}: {e}"))
        })
    }
}
