//! # Prelude
//!
//! Commonly used types and traits from tributary core.

pub use crate::{
    client::{PartitionInfo, ProducerClient, ProducerFactory},
    config::{SenderConfig, SenderOptions},
    error::{Error, Result},
    record::{Header, ProducerRecord, RecordMetadata, SenderRecord, SenderResult, SerializedRecord},
    serializer::{BytesSerializer, IntegerSerializer, JsonSerializer, Serializer, StringSerializer},
    types::{Offset, OffsetAndMetadata, Timestamp, TopicPartition, TransactionOffsets},
};

pub use bytes::Bytes;
pub use chrono::{DateTime, Utc};
