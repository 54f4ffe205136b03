// Kafka module - rdkafka-backed broker client with synchronous rebalance hand-off
pub mod client;
pub mod config;
pub mod context;

pub use client::KafkaBrokerClient;
pub use config::ConsumerConfigBuilder;
pub use context::DispatchConsumerContext;
