//! # Tributary Core
//!
//! Shared building blocks for the tributary sender: the record data model,
//! serializers, sender options and configuration loading, the error
//! taxonomy and logging setup.
//!
//! ## Quick Start
//!
//! ```rust
//! use tributary_core::prelude::*;
//!
//! let options: SenderOptions<i32, String> = SenderOptions::new()
//!     .with_key_serializer(IntegerSerializer)
//!     .with_value_serializer(StringSerializer)
//!     .with_max_in_flight(64)
//!     .with_stop_on_error(false);
//! assert!(options.validate().is_ok());
//!
//! let record = SenderRecord::create(ProducerRecord::new("orders", "hello".to_string()).with_key(1), 1u64);
//! assert_eq!(record.topic(), "orders");
//! ```
//!
//! ## Architecture
//!
//! - [`client`]: contract of the underlying producer client and its factory
//! - [`record`]: outbound records, delivery metadata and per-record results
//! - [`serializer`]: key/value serializers applied before dispatch
//! - [`config`]: immutable [`SenderOptions`] plus file/env configuration
//! - [`error`]: error types and result handling
//! - [`telemetry`]: `tracing` subscriber installation
//! - [`types`]: topic partitions, offsets and timestamps

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod prelude;
pub mod record;
pub mod serializer;
pub mod telemetry;
pub mod types;

pub use crate::{
    client::{DeliveryCallback, PartitionInfo, ProducerClient, ProducerFactory},
    config::{SenderConfig, SenderOptions},
    error::{Error, Result},
    record::{ProducerRecord, RecordMetadata, SenderRecord, SenderResult, SerializedRecord},
    serializer::Serializer,
    types::{Offset, OffsetAndMetadata, Timestamp, TopicPartition, TransactionOffsets},
};

/// Crate version, reported in startup logs.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
