// src/pool/mod.rs
//! Bounded pool of browser handles.
//!
//! At most `size` handles are ever live (idle + leased). Callers beyond
//! capacity wait on a semaphore; idle handles are checked before reuse and
//! replaced when dead. A [`Lease`] that is dropped without going through
//! [`BrowserPool::release`] (cancelled task, panic) destroys its handle.

pub mod browser;

use std::collections::HashSet;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::error::PoolError;
pub use browser::{Browser, BrowserFactory};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    /// Launch attempts per tier before falling through to the next one.
    pub launch_attempts_per_tier: u32,
    pub launch_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 3,
            launch_attempts_per_tier: 2,
            launch_backoff: Duration::from_millis(500),
        }
    }
}

/// How the lease holder's work went; drives the release-time health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Healthy,
    /// The handle reported an error; check liveness before returning it to idle.
    Failed,
    /// Known broken; destroy without probing.
    Broken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub outstanding: usize,
    pub created: u64,
    pub destroyed: u64,
}

struct Idle {
    id: u64,
    browser: Box<dyn Browser>,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<Idle>,
    leased: HashSet<u64>,
    next_id: u64,
    created: u64,
    destroyed: u64,
    closed: bool,
}

struct PoolInner {
    config: PoolConfig,
    factories: Vec<Arc<dyn BrowserFactory>>,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

#[derive(Clone)]
pub struct BrowserPool {
    inner: Arc<PoolInner>,
}

impl BrowserPool {
    pub fn new(config: PoolConfig, factories: Vec<Arc<dyn BrowserFactory>>) -> Self {
        let size = config.size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                config: PoolConfig { size, ..config },
                factories,
                permits: Arc::new(Semaphore::new(size)),
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Wait for capacity, then hand out a live handle (reused or freshly launched).
    pub async fn acquire(&self) -> Result<Lease, PoolError> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        loop {
            let candidate = {
                let mut st = self.inner.lock();
                if st.closed {
                    return Err(PoolError::Closed);
                }
                st.idle.pop()
            };
            let Some(idle) = candidate else { break };
            let check = IdleCheck::new(&self.inner, idle);
            let alive = check.is_alive().await;
            let Some(idle) = check.disarm() else { continue };
            if alive {
                debug!(handle = idle.id, tier = idle.browser.tier(), "reusing idle browser handle");
                return Ok(self.lend(idle.id, idle.browser, permit));
            }
            warn!(
                handle = idle.id,
                tier = idle.browser.tier(),
                "idle browser handle failed liveness check, replacing"
            );
            self.inner.destroy(idle.browser).await;
        }

        let (id, browser) = self.inner.launch().await?;
        Ok(self.lend(id, browser, permit))
    }

    /// Return a handle. Healthy handles go back to idle, unhealthy ones are destroyed.
    pub async fn release(&self, mut lease: Lease, outcome: LeaseOutcome) {
        // check through the lease: if this future is dropped mid-check, the
        // lease's drop still tears the handle down
        let healthy = match outcome {
            LeaseOutcome::Healthy => true,
            LeaseOutcome::Failed => lease.is_alive().await,
            LeaseOutcome::Broken => false,
        };
        let Some(browser) = lease.browser.take() else {
            return;
        };

        let doomed = {
            let mut st = self.inner.lock();
            st.leased.remove(&lease.id);
            gauge!("pool_outstanding").set(st.leased.len() as f64);
            if healthy && !st.closed {
                st.idle.push(Idle {
                    id: lease.id,
                    browser,
                });
                None
            } else {
                Some(browser)
            }
        };
        if let Some(b) = doomed {
            debug!(handle = lease.id, "destroying unhealthy browser handle on release");
            self.inner.destroy(b).await;
        }
        // permit returns to the semaphore when `lease` drops here
    }

    /// Close all idle handles and refuse further acquisitions.
    /// Outstanding leases are destroyed when released.
    pub async fn shutdown(&self) {
        let drained = {
            let mut st = self.inner.lock();
            st.closed = true;
            std::mem::take(&mut st.idle)
        };
        self.inner.permits.close();
        for idle in drained {
            self.inner.destroy(idle.browser).await;
        }
        info!("browser pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.inner.lock();
        PoolStats {
            size: self.inner.config.size,
            idle: st.idle.len(),
            outstanding: st.leased.len(),
            created: st.created,
            destroyed: st.destroyed,
        }
    }

    fn lend(&self, id: u64, browser: Box<dyn Browser>, permit: OwnedSemaphorePermit) -> Lease {
        {
            let mut st = self.inner.lock();
            st.leased.insert(id);
            gauge!("pool_outstanding").set(st.leased.len() as f64);
        }
        Lease {
            id,
            browser: Some(browser),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        }
    }
}

impl PoolInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().expect("pool state mutex poisoned")
    }

    /// Walk the tiers in order; each gets a bounded number of attempts.
    async fn launch(&self) -> Result<(u64, Box<dyn Browser>), PoolError> {
        let attempts = self.config.launch_attempts_per_tier.max(1);
        let mut last_error = String::from("no construction tiers configured");

        for factory in &self.factories {
            for attempt in 1..=attempts {
                match factory.launch().await {
                    Ok(browser) => {
                        let id = {
                            let mut st = self.lock();
                            st.next_id += 1;
                            st.created += 1;
                            st.next_id
                        };
                        counter!("pool_handles_created_total", "tier" => factory.tier())
                            .increment(1);
                        info!(handle = id, tier = factory.tier(), attempt, "browser handle launched");
                        return Ok((id, browser));
                    }
                    Err(e) => {
                        warn!(tier = factory.tier(), attempt, error = %e, "browser launch failed");
                        last_error = format!("{}: {e:#}", factory.tier());
                        if attempt < attempts && !self.config.launch_backoff.is_zero() {
                            tokio::time::sleep(self.config.launch_backoff * attempt).await;
                        }
                    }
                }
            }
        }

        counter!("pool_exhausted_total").increment(1);
        Err(PoolError::Exhausted {
            tiers: self.factories.len(),
            last_error,
        })
    }

    async fn destroy(&self, browser: Box<dyn Browser>) {
        self.lock().destroyed += 1;
        browser.close().await;
    }

    /// Drop-path teardown: no await available, so close in the background.
    fn destroy_detached(&self, id: u64, browser: Box<dyn Browser>) {
        {
            let mut st = self.lock();
            st.leased.remove(&id);
            st.destroyed += 1;
            gauge!("pool_outstanding").set(st.leased.len() as f64);
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { browser.close().await });
        }
    }
}

/// An idle handle popped for its liveness check. Dropped before
/// [`IdleCheck::disarm`], it destroys the handle.
struct IdleCheck<'a> {
    pool: &'a PoolInner,
    idle: Option<Idle>,
}

impl<'a> IdleCheck<'a> {
    fn new(pool: &'a PoolInner, idle: Idle) -> Self {
        Self {
            pool,
            idle: Some(idle),
        }
    }

    async fn is_alive(&self) -> bool {
        match &self.idle {
            Some(idle) => idle.browser.is_alive().await,
            None => false,
        }
    }

    fn disarm(mut self) -> Option<Idle> {
        self.idle.take()
    }
}

impl Drop for IdleCheck<'_> {
    fn drop(&mut self) {
        if let Some(idle) = self.idle.take() {
            warn!(handle = idle.id, "acquire cancelled during liveness check, destroying handle");
            self.pool.destroy_detached(idle.id, idle.browser);
        }
    }
}

/// Exclusive use of one handle. Derefs to the [`Browser`].
pub struct Lease {
    id: u64,
    browser: Option<Box<dyn Browser>>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub fn handle_id(&self) -> u64 {
        self.id
    }
}

impl Deref for Lease {
    type Target = dyn Browser;

    fn deref(&self) -> &Self::Target {
        self.browser
            .as_deref()
            .expect("lease holds its browser until released")
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(browser) = self.browser.take() {
            warn!(handle = self.id, "browser lease dropped without release, destroying handle");
            self.pool.destroy_detached(self.id, browser);
        }
    }
}
