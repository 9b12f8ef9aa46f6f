//! # Tributary Sender
//!
//! Backpressure-aware asynchronous sending of records to a Kafka-style
//! broker, with transactional exactly-once support.
//!
//! A [`KafkaSender`] turns a stream of [`SenderRecord`]s into a stream of
//! [`SenderResult`]s, keeping the number of records in flight bounded and
//! carrying each record's correlation metadata through to its result.
//! Transactional senders additionally expose a [`TransactionManager`].
//!
//! ## Architecture
//!
//! - [`sender`]: the [`KafkaSender`] facade
//! - [`pipeline`]: per-stream send pipelines and their [`SendResults`]
//! - [`transaction`]: transaction states and the [`TransactionManager`]
//! - `handle`: the shared producer and its single worker thread
//!
//! [`SenderRecord`]: tributary_core::SenderRecord
//! [`SenderResult`]: tributary_core::SenderResult

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod handle;
pub mod pipeline;
pub mod sender;
pub mod transaction;

pub use crate::{
    pipeline::{PipelineState, SendResults},
    sender::KafkaSender,
    transaction::{TransactionManager, TransactionObserver, TransactionState},
};
pub use tributary_core::{Error, Result};
