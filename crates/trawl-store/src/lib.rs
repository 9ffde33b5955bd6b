pub mod config;
pub mod redis_store;

pub use config::RedisConfig;
pub use redis_store::RedisStore;
