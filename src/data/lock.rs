//! Keyed mutual exclusion over a data store.
//!
//! Two strategies share the [`KeyedLock`] interface: [`NativeAdvisoryLock`]
//! delegates to a store-native TTL mutex, and [`PollingLock`] writes lock
//! records into a plain [`DataStore`] and retries with jittered exponential
//! backoff until a wait budget runs out.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use log::{debug, warn};
use rand::Rng;
use serde_json::{json, Value};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

use super::store::{AdvisoryLockBackend, DataStore};

/// Identity of this process as a lock holder.
pub fn process_identity() -> &'static str {
    static IDENTITY: OnceLock<String> = OnceLock::new();
    IDENTITY.get_or_init(|| {
        format!(
            "pid{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        )
    })
}

/// Proof of a held lock, handed back to [`KeyedLock::release`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    pub holder: String,
}

impl LockToken {
    /// Fresh holder id, unique per acquisition so threads of one process exclude each other.
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            holder: format!("{}/{}", process_identity(), uuid::Uuid::new_v4().simple()),
        }
    }
}

pub trait KeyedLock: Send + Sync {
    /// Blocks until `key` is held or the wait budget is exhausted
    /// ([`SyncError::LockTimeout`]).
    fn acquire(&self, key: &str) -> Result<LockToken>;

    fn release(&self, token: &LockToken) -> Result<()>;
}

/// Releases its lock when dropped.
pub struct LockGuard<'a> {
    lock: &'a dyn KeyedLock,
    token: Option<LockToken>,
}

impl<'a> LockGuard<'a> {
    pub fn acquire(lock: &'a dyn KeyedLock, key: &str) -> Result<Self> {
        let token = lock.acquire(key)?;
        Ok(Self {
            lock,
            token: Some(token),
        })
    }

    pub fn key(&self) -> &str {
        self.token.as_ref().map_or("", |t| t.key.as_str())
    }

    /// Releases now and reports the outcome instead of logging it.
    pub fn release(mut self) -> Result<()> {
        match self.token.take() {
            Some(token) => self.lock.release(&token),
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(err) = self.lock.release(&token) {
                warn!("failed to release lock '{}': {}", token.key, err);
            }
        }
    }
}

/// Exponential backoff with relative jitter and a total wait budget.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub jitter: f64,
    pub budget: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl Backoff {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.lock_initial_backoff_ms),
            jitter: config.lock_jitter,
            budget: config.lock_wait(),
        }
    }

    /// Delay before retry number `attempt` (0-based): `initial * 2^attempt`, jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial.saturating_mul(2u32.saturating_pow(attempt.min(16)));
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64(factor)
    }

    /// Calls `attempt` until it returns true or the budget is spent.
    fn run(&self, key: &str, mut attempt: impl FnMut() -> Result<bool>) -> Result<()> {
        let started = Instant::now();
        let mut retry = 0u32;
        loop {
            if attempt()? {
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= self.budget {
                return Err(SyncError::LockTimeout {
                    name: key.to_string(),
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
            let delay = self.delay(retry).min(self.budget - elapsed);
            debug!("lock '{}' busy, retry {} in {:?}", key, retry + 1, delay);
            std::thread::sleep(delay);
            retry += 1;
        }
    }
}

/// Lock backed by the store's own advisory mutex.
pub struct NativeAdvisoryLock {
    backend: Arc<dyn AdvisoryLockBackend>,
    ttl: Duration,
    wait: Duration,
}

impl NativeAdvisoryLock {
    pub fn new(backend: Arc<dyn AdvisoryLockBackend>, ttl: Duration, wait: Duration) -> Self {
        Self { backend, ttl, wait }
    }

    pub fn from_config(backend: Arc<dyn AdvisoryLockBackend>, config: &SyncConfig) -> Self {
        Self::new(backend, config.lock_ttl(), config.lock_wait())
    }
}

impl KeyedLock for NativeAdvisoryLock {
    fn acquire(&self, key: &str) -> Result<LockToken> {
        let token = LockToken::new(key);
        let started = Instant::now();
        if self
            .backend
            .advisory_lock(key, &token.holder, self.ttl, self.wait)?
        {
            return Ok(token);
        }
        Err(SyncError::LockTimeout {
            name: key.to_string(),
            waited_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn release(&self, token: &LockToken) -> Result<()> {
        if !self.backend.advisory_unlock(&token.key, &token.holder)? {
            debug!("lock '{}' was no longer held by {}", token.key, token.holder);
        }
        Ok(())
    }
}

/// Lock records written into a [`DataStore`], for stores without advisory locks.
pub struct PollingLock {
    store: Arc<dyn DataStore>,
    ttl: Duration,
    backoff: Backoff,
}

impl PollingLock {
    pub fn new(store: Arc<dyn DataStore>, ttl: Duration, backoff: Backoff) -> Self {
        Self {
            store,
            ttl,
            backoff,
        }
    }

    pub fn from_config(store: Arc<dyn DataStore>, config: &SyncConfig) -> Self {
        Self::new(store, config.lock_ttl(), Backoff::from_config(config))
    }

    fn record(holder: &str) -> Value {
        json!({ "holder": holder })
    }

    fn try_acquire(&self, token: &LockToken) -> Result<bool> {
        let record = Self::record(&token.holder);
        if self
            .store
            .insert_if_absent(&token.key, &record, Some(self.ttl))?
        {
            return Ok(true);
        }
        let held_by_us = self.store.get(&token.key)?.is_some_and(|r| {
            r.value.get("holder").and_then(Value::as_str) == Some(token.holder.as_str())
        });
        Ok(held_by_us)
    }
}

impl KeyedLock for PollingLock {
    fn acquire(&self, key: &str) -> Result<LockToken> {
        let token = LockToken::new(key);
        self.backoff.run(key, || self.try_acquire(&token))?;
        Ok(token)
    }

    fn release(&self, token: &LockToken) -> Result<()> {
        if !self
            .store
            .compare_and_delete(&token.key, &Self::record(&token.holder))?
        {
            debug!("lock '{}' expired before release", token.key);
        }
        Ok(())
    }
}
