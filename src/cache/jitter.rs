//! TTL jitter
//!
//! Entries written together would otherwise expire together. Every write stretches or
//! shrinks its TTL by a uniform random factor within `[1 - f, 1 + f]`.

use std::time::Duration;

/// `ttl * (1 ± factor)`, clamped to the exact bounds
pub fn jittered_ttl(ttl: Duration, factor: f64) -> Duration {
    let factor = factor.clamp(0.0, 0.999);
    if factor == 0.0 || ttl.is_zero() {
        return ttl;
    }
    let (low, high) = jitter_bounds(ttl, factor);
    let scale = 1.0 + factor * (2.0 * fastrand::f64() - 1.0);
    ttl.mul_f64(scale).clamp(low, high)
}

/// Lowest and highest TTL `jittered_ttl` can produce
pub fn jitter_bounds(ttl: Duration, factor: f64) -> (Duration, Duration) {
    let factor = factor.clamp(0.0, 0.999);
    (ttl.mul_f64(1.0 - factor), ttl.mul_f64(1.0 + factor))
}
