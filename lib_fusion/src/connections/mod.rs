//! # Connections Module
//!
//! Adapters to external services: the PostgreSQL sample store and the Redis
//! metrics sink. Only built with the `connections` feature.

/// PostgreSQL implementation of the sample store.
pub mod db_postgres;

/// Redis-backed metrics sink.
pub mod cache_redis;

pub use cache_redis::RedisMetricsSink;
pub use db_postgres::PgSampleStore;
