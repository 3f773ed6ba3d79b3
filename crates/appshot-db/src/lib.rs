pub mod backend;
pub mod config;
pub mod database;
pub mod job_repository;
pub mod queue_repository;
pub mod redis_cache;

pub use backend::{Backends, BrokerBackend, CacheBackend, JobBackend};
pub use config::{DatabaseConfig, RedisConfig};
pub use database::Database;
pub use job_repository::JobRepository;
pub use queue_repository::QueueRepository;
pub use redis_cache::RedisCache;
