//! Per-connection rate limiting for queue sockets.
//!
//! Every inbound text frame costs one token. A socket that runs dry gets a
//! `rate_limited` error frame with a retry hint and the frame is dropped.

use std::time::{Duration, Instant};

/// Default burst capacity (frames).
pub const DEFAULT_RATE_LIMIT_BURST: u32 = 100;
/// Default sustained rate (frames per second).
pub const DEFAULT_RATE_LIMIT_SUSTAINED: u32 = 10;

/// Upper bound on the retry hint sent to a throttled client.
const MAX_RETRY_AFTER_MS: u64 = 10_000;

/// Token bucket limits applied to each socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Frames accepted back to back before throttling.
    pub burst: u32,
    /// Frames per second once the burst is spent.
    pub sustained: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: DEFAULT_RATE_LIMIT_BURST,
            sustained: DEFAULT_RATE_LIMIT_SUSTAINED,
        }
    }
}

/// Token bucket for one queue socket.
///
/// Holds up to `capacity` tokens and refills at `refill_rate` tokens per second.
#[derive(Debug)]
pub struct RateLimiter {
    /// Tokens available now.
    tokens: f64,
    /// Burst limit.
    capacity: f64,
    /// Tokens added per second.
    refill_rate: f64,
    /// When `tokens` was last topped up.
    last_refill: Instant,
}

impl RateLimiter {
    /// Full bucket for `config`.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            tokens: f64::from(config.burst),
            capacity: f64::from(config.burst),
            refill_rate: f64::from(config.sustained),
            last_refill: Instant::now(),
        }
    }

    /// Take a token for one frame. Returns false when the socket is throttled.
    pub fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Time until the next token, `None` if one is available now.
    #[must_use]
    pub fn time_until_available(&self) -> Option<Duration> {
        if self.tokens >= 1.0 {
            None
        } else if self.refill_rate <= 0.0 {
            Some(Duration::MAX)
        } else {
            Some(Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate))
        }
    }

    /// Retry hint for a throttled client, in milliseconds.
    #[must_use]
    pub fn retry_after_ms(&self) -> u64 {
        self.time_until_available().map_or(0, |wait| {
            u64::try_from(wait.as_millis())
                .unwrap_or(u64::MAX)
                .clamp(1, MAX_RETRY_AFTER_MS)
        })
    }
}
