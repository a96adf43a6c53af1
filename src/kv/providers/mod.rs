//! Key-value provider implementations

pub mod memory;
pub mod redis;

pub use self::memory::MemoryKvBackend;
pub use self::redis::RedisKvBackend;
