//! # Tributary Testkit
//!
//! In-memory stand-ins for a broker cluster and producer client, used to
//! exercise tributary senders without a running broker.
//!
//! - [`MockCluster`]: topics, partition logs, leader and authentication
//!   failure injection, transactional visibility and group offsets
//! - [`MockProducer`]: a [`ProducerClient`](tributary_core::ProducerClient)
//!   acknowledging from its own executor thread, with send delay, hung
//!   acknowledgements and call counters
//! - [`MockProducerFactory`]: hands out mock producers and remembers them

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cluster;
pub mod factory;
pub mod producer;

pub use crate::{
    cluster::{MockCluster, RecordStatus, StoredRecord},
    factory::MockProducerFactory,
    producer::{MockProducer, ProducerCounters},
};
