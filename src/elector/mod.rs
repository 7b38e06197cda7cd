//! Leader election over an external lease
//!
//! A fleet of identical replicas contends for one lease; the holder is the
//! only replica allowed to fire schedules. The protocol is a poll loop: the
//! leader renews its claim every retry period, everyone else attempts an
//! atomic takeover of a vacant or expired lease. Leadership is exposed both
//! as a synchronous [`LeaderState`] query and as lifecycle callbacks.

mod lease;

pub use lease::{LeaseError, LeaseRecord, LeaseStore, MongoLeaseStore};

use crate::server::ShutdownSignal;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

#[cfg(test)]
#[path = "elector_test.rs"]
mod elector_tests;

/// Default validity of an acquired lease without renewal
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(3);

/// Default slack before which the leader must have renewed or must yield
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(2);

/// Default polling interval for non-leaders and renew cadence for the leader
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_millis(300);

/// Election configuration
#[derive(Debug, Clone)]
pub struct ElectorConfig {
    /// Process identity recorded in the lease
    pub candidate_id: String,
    /// How long an acquired lease is valid without renewal
    pub lease_duration: Duration,
    /// A leader that has not renewed within this much of its last
    /// successful renewal yields leadership
    pub renew_deadline: Duration,
    /// Poll interval for contention and renewal
    pub retry_period: Duration,
    /// Write back a released lease on graceful shutdown so the next
    /// election completes in one retry period
    pub release_on_cancel: bool,
}

impl ElectorConfig {
    /// Build config from the environment
    ///
    /// Uses `HOSTNAME` for the candidate identity, falling back to a
    /// freshly minted unique id.
    pub fn from_env() -> Self {
        let candidate_id = std::env::var("HOSTNAME")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            candidate_id,
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
            release_on_cancel: true,
        }
    }
}

/// Elector construction errors
#[derive(Debug, Error)]
pub enum ElectorError {
    #[error("invalid elector config: {0}")]
    InvalidConfig(String),
}

/// Shared leadership flag
///
/// Updated by the election driver on every transition; reading it never
/// blocks or yields, so the firing path can consult it per entry.
#[derive(Clone)]
pub struct LeaderState {
    is_leader: Arc<AtomicBool>,
}

impl LeaderState {
    /// New state, initially not leader
    pub fn new() -> Self {
        Self {
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether this replica currently holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Update leadership; driver-internal except for single-instance runs
    pub fn set_leader(&self, is_leader: bool) {
        self.is_leader.store(is_leader, Ordering::SeqCst);
    }
}

impl Default for LeaderState {
    fn default() -> Self {
        Self::new()
    }
}

type LeaderCallback = Box<dyn Fn(&str) + Send + Sync>;
type NewLeaderCallback = Box<dyn Fn(&str, &str) + Send + Sync>;

/// Runs the lease protocol for one replica
pub struct Elector {
    store: Arc<dyn LeaseStore>,
    config: ElectorConfig,
    state: LeaderState,
    on_started_leading: Option<LeaderCallback>,
    on_stopped_leading: Option<LeaderCallback>,
    on_new_leader: Option<NewLeaderCallback>,
}

impl Elector {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        config: ElectorConfig,
        state: LeaderState,
    ) -> Result<Self, ElectorError> {
        if config.candidate_id.is_empty() {
            return Err(ElectorError::InvalidConfig("empty candidate id".into()));
        }
        if config.renew_deadline >= config.lease_duration {
            return Err(ElectorError::InvalidConfig(format!(
                "renew deadline {:?} must be shorter than lease duration {:?}",
                config.renew_deadline, config.lease_duration
            )));
        }
        if config.retry_period.is_zero() {
            return Err(ElectorError::InvalidConfig("zero retry period".into()));
        }
        Ok(Self {
            store,
            config,
            state,
            on_started_leading: None,
            on_stopped_leading: None,
            on_new_leader: None,
        })
    }

    /// Invoked on the driver task when this replica acquires the lease
    pub fn on_started_leading(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_started_leading = Some(Box::new(f));
        self
    }

    /// Invoked on the driver task when this replica loses or yields the lease
    pub fn on_stopped_leading(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_stopped_leading = Some(Box::new(f));
        self
    }

    /// Invoked when a different holder (possibly this replica) is observed
    pub fn on_new_leader(mut self, f: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.on_new_leader = Some(Box::new(f));
        self
    }

    /// Synchronous leadership query backed by the shared state
    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    /// Drive the election until `shutdown` fires
    ///
    /// Backend errors are transient: the loop retries forever, but a leader
    /// that cannot renew within the renew deadline yields. Cancellation
    /// releases the lease when configured to.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let candidate = self.config.candidate_id.clone();
        info!(
            candidate = %candidate,
            lease_duration = ?self.config.lease_duration,
            retry_period = ?self.config.retry_period,
            "starting leader election"
        );

        // First tick fires immediately so a fresh replica contends right away
        let mut tick = tokio::time::interval(self.config.retry_period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut observed_leader: Option<String> = None;
        let mut last_renew = Instant::now();

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if self.state.is_leader() {
                        self.leader_tick(&candidate, &mut last_renew).await;
                    } else {
                        self.follower_tick(&candidate, &mut observed_leader, &mut last_renew)
                            .await;
                    }
                }
                _ = shutdown.wait() => {
                    if self.state.is_leader() {
                        if self.config.release_on_cancel {
                            if let Err(e) = self.store.release(&candidate).await {
                                warn!(error = %e, "failed to release lease on shutdown");
                            } else {
                                info!(candidate = %candidate, "released lease");
                            }
                        }
                        self.state.set_leader(false);
                        self.fire_stopped(&candidate);
                    }
                    info!(candidate = %candidate, "leader election shutting down");
                    break;
                }
            }
        }
    }

    fn lease_expiry(&self) -> chrono::DateTime<Utc> {
        let validity = chrono::Duration::from_std(self.config.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(3));
        Utc::now() + validity
    }

    async fn leader_tick(&self, candidate: &str, last_renew: &mut Instant) {
        match self.store.renew(candidate, self.lease_expiry()).await {
            Ok(true) => {
                *last_renew = Instant::now();
            }
            Ok(false) => {
                // Somebody took the lease over; re-contend on the next tick
                warn!(candidate = %candidate, "lost lease");
                self.state.set_leader(false);
                self.fire_stopped(candidate);
            }
            Err(e) => {
                warn!(candidate = %candidate, error = %e, "lease renewal error");
                if last_renew.elapsed() >= self.config.renew_deadline {
                    warn!(candidate = %candidate, "renew deadline exceeded, yielding leadership");
                    self.state.set_leader(false);
                    self.fire_stopped(candidate);
                }
            }
        }
    }

    async fn follower_tick(
        &self,
        candidate: &str,
        observed_leader: &mut Option<String>,
        last_renew: &mut Instant,
    ) {
        match self.store.try_acquire(candidate, self.lease_expiry()).await {
            Ok(true) => {
                *last_renew = Instant::now();
                self.state.set_leader(true);
                info!(candidate = %candidate, "acquired leadership");
                if let Some(f) = &self.on_started_leading {
                    f(candidate);
                }
                if observed_leader.as_deref() != Some(candidate) {
                    *observed_leader = Some(candidate.to_string());
                    if let Some(f) = &self.on_new_leader {
                        f(candidate, candidate);
                    }
                }
            }
            Ok(false) => {
                match self.store.get().await {
                    Ok(Some(record)) => {
                        if let Some(holder) = record.holder {
                            if observed_leader.as_deref() != Some(holder.as_str()) {
                                info!(candidate = %candidate, leader = %holder, "observed new leader");
                                if let Some(f) = &self.on_new_leader {
                                    f(candidate, &holder);
                                }
                                *observed_leader = Some(holder);
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(candidate = %candidate, error = %e, "lease read error");
                    }
                }
            }
            Err(e) => {
                // Transient; keep contending forever
                warn!(candidate = %candidate, error = %e, "lease acquire error");
            }
        }
    }

    fn fire_stopped(&self, candidate: &str) {
        if let Some(f) = &self.on_stopped_leading {
            f(candidate);
        }
    }
}
