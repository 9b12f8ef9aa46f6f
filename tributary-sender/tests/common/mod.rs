#![allow(dead_code)]

use std::time::Duration;
use tributary_core::config::LoggingConfig;
use tributary_core::prelude::*;
use tributary_core::telemetry::init_logging;
use tributary_sender::KafkaSender;
use tributary_testkit::{MockCluster, MockProducerFactory};

pub const TOPIC: &str = "events";

pub fn init_test_logging() {
    let config = LoggingConfig { level: "debug".to_string(), ..LoggingConfig::default() };
    let _ = init_logging(&config);
}

pub fn options() -> SenderOptions<i32, String> {
    SenderOptions::new()
        .with_key_serializer(IntegerSerializer)
        .with_value_serializer(StringSerializer)
}

pub fn cluster() -> MockCluster {
    MockCluster::new().with_topic(TOPIC, 3)
}

pub fn sender(
    factory: &MockProducerFactory,
    options: SenderOptions<i32, String>,
) -> KafkaSender<i32, String> {
    init_test_logging();
    KafkaSender::create(factory.clone(), options).expect("valid sender options")
}

pub fn record(topic: &str, i: i32) -> SenderRecord<i32, String, i32> {
    SenderRecord::create(ProducerRecord::new(topic, format!("message-{i}")).with_key(i), i)
}

pub fn records(topic: &str, count: i32) -> Vec<SenderRecord<i32, String, i32>> {
    (0..count).map(|i| record(topic, i)).collect()
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
