//! Key-value store trait definition

use super::errors::KvResult;
use std::future::Future;
use std::time::Duration;

/// Operations the lock manager and the remote cache tier need from a key-value instance
///
/// Mirrors a Redis-compatible command set: plain GET/SET/DEL, SET-if-not-exists with
/// expiry, PEXPIRE, pattern listing, and two token-checked scripts. Every method must
/// return within the provider's command timeout.
pub trait KvStore: Send + Sync {
    /// Read a value
    fn get(&self, key: &str) -> impl Future<Output = KvResult<Option<String>>> + Send;

    /// Write a value, optionally with an expiry
    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> impl Future<Output = KvResult<()>> + Send;

    /// Write a value only if the key is absent; returns whether the write happened
    fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = KvResult<bool>> + Send;

    /// Remove a key; returns whether it existed
    fn delete(&self, key: &str) -> impl Future<Output = KvResult<bool>> + Send;

    /// Reset the expiry of an existing key
    fn expire(&self, key: &str, ttl: Duration) -> impl Future<Output = KvResult<bool>> + Send;

    /// List keys matching a glob pattern
    fn keys(&self, pattern: &str) -> impl Future<Output = KvResult<Vec<String>>> + Send;

    /// Remove several keys at once; returns how many existed
    fn delete_many(&self, keys: &[String]) -> impl Future<Output = KvResult<u64>> + Send;

    /// Delete `key` only if it currently holds `expected`
    fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> impl Future<Output = KvResult<bool>> + Send;

    /// Reset the expiry of `key` only if it currently holds `expected`
    fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> impl Future<Output = KvResult<bool>> + Send;

    /// Round-trip health probe
    fn ping(&self) -> impl Future<Output = KvResult<()>> + Send;

    /// Instance name used in logs and events
    fn name(&self) -> &str;
}
