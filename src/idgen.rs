// 🎲 Collision-Safe Identifier Generator
//
// Mints a tenant's external address ("3f9c0a7d12e4b6c8@inbound.example.com").
// Each attempt draws a fresh candidate and asks the store whether it is
// taken; a collision waits base * 2^(n-1) (capped) before the next try.
//
// The pre-check is best effort: the store's unique constraint still has the
// last word at insert time, and callers regenerate when it fires.

use crate::config::IdentifierConfig;
use crate::error::EngineError;
use anyhow::Result;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

// ============================================================================
// SLEEPER
// ============================================================================

/// Blocks between attempts; swapped out in tests.
pub trait Sleeper {
    fn sleep(&mut self, delay: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

// ============================================================================
// CANDIDATES
// ============================================================================

/// 16 hex chars: the first 8 bytes of SHA-256 over a fresh v4 UUID
pub fn random_token() -> String {
    let digest = Sha256::digest(uuid::Uuid::new_v4().as_bytes());
    digest[..8].iter().map(|byte| format!("{:02x}", byte)).collect()
}

/// Delay after the `collision`-th collision (1-based)
pub fn backoff_delay(base: Duration, max: Duration, collision: u32) -> Duration {
    let factor = 1u32.checked_shl(collision.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

// ============================================================================
// GENERATOR
// ============================================================================

pub struct UniqueIdGenerator {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    candidates: Box<dyn FnMut() -> String + Send>,
    sleeper: Box<dyn Sleeper + Send>,
}

impl UniqueIdGenerator {
    /// Address generator for `domain` with real sleeps
    pub fn for_domain(config: &IdentifierConfig) -> Self {
        let domain = config.address_domain.clone();

        UniqueIdGenerator {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            candidates: Box::new(move || format!("{}@{}", random_token(), domain)),
            sleeper: Box::new(ThreadSleeper),
        }
    }

    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        candidates: Box<dyn FnMut() -> String + Send>,
        sleeper: Box<dyn Sleeper + Send>,
    ) -> Self {
        UniqueIdGenerator {
            max_attempts,
            base_delay,
            max_delay: Duration::MAX,
            candidates,
            sleeper,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Return the first candidate `check_exists` reports as free.
    ///
    /// Fails with `ExhaustedRetries` after `max_attempts` collisions; store
    /// faults raised by `check_exists` propagate immediately.
    pub fn generate_unique<F>(&mut self, mut check_exists: F) -> Result<String>
    where
        F: FnMut(&str) -> Result<bool>,
    {
        for attempt in 1..=self.max_attempts {
            let candidate = (self.candidates)();

            if !check_exists(&candidate)? {
                debug!(attempt, "unique identifier minted");
                return Ok(candidate);
            }

            if attempt == self.max_attempts {
                break;
            }

            let delay = backoff_delay(self.base_delay, self.max_delay, attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, "identifier collision; backing off");
            self.sleeper.sleep(delay);
        }

        Err(EngineError::ExhaustedRetries {
            attempts: self.max_attempts,
        }
        .into())
    }
}

/// One-shot generation with the default random address candidates.
pub fn generate_unique<F>(max_attempts: u32, config: &IdentifierConfig, check_exists: F) -> Result<String>
where
    F: FnMut(&str) -> Result<bool>,
{
    let mut generator = UniqueIdGenerator::for_domain(config);
    generator.max_attempts = max_attempts;
    generator.generate_unique(check_exists)
}
