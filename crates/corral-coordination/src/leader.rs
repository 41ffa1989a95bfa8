//! Leader election over a renewable mutex.
//!
//! Exactly one process holds leadership for a name at a time. The leader
//! renews its lock every `ttl / renewal_divisor` from a background task; if
//! a renewal is refused or fails, the task reports loss of leadership and
//! stops. A leader that crashes stops renewing and its lock expires, so a
//! successor can take over within one TTL.
//!
//! The renewal task is owned by the [`LeaderLock`] and stopped through a
//! [`CancellationToken`]; [`LeaderLock::release`] waits for it to finish
//! before deleting the lock so no renewal can race with the release.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::constants::DEFAULT_LEADER_RENEWAL_DIVISOR;
use crate::constants::DEFAULT_LEADER_TTL_MS;
use crate::constants::MAX_LEADER_RENEWAL_DIVISOR;
use crate::constants::MAX_TTL_MS;
use crate::error::CoordinationError;
use crate::error::at_most;
use crate::error::invalid;
use crate::mutex::DistributedMutex;
use crate::types::LockHandle;
use crate::verified;

/// Configuration for [`LeaderLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderConfig {
    /// Lifetime of the leader lock between renewals.
    pub ttl: Duration,
    /// The lock is renewed every `ttl / renewal_divisor`.
    pub renewal_divisor: u32,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(DEFAULT_LEADER_TTL_MS),
            renewal_divisor: DEFAULT_LEADER_RENEWAL_DIVISOR,
        }
    }
}

impl LeaderConfig {
    /// Check every value is in range.
    pub fn validate(&self) -> Result<(), CoordinationError> {
        if self.ttl < Duration::from_millis(2) {
            return Err(invalid("leader", "ttl must be at least 2ms"));
        }
        if self.renewal_divisor < 2 {
            return Err(invalid("leader", "renewal_divisor must be at least 2 so renewal precedes expiry"));
        }
        if self.renewal_divisor > MAX_LEADER_RENEWAL_DIVISOR {
            return Err(invalid("leader", format!("renewal_divisor must be at most {MAX_LEADER_RENEWAL_DIVISOR}")));
        }
        at_most("leader", "ttl", self.ttl, MAX_TTL_MS)?;
        Ok(())
    }

    /// Period of the renewal loop.
    pub fn renewal_interval(&self) -> Duration {
        verified::renewal_interval(self.ttl, self.renewal_divisor)
    }
}

/// Whether this process currently leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipState {
    /// Another process leads, or nobody does.
    NotLeader,
    /// This process holds the leader lock.
    Leader,
}

/// A held leadership term.
struct Term {
    handle: LockHandle,
    cancel: CancellationToken,
    renewal: JoinHandle<()>,
}

/// Leadership of one named role.
pub struct LeaderLock {
    name: String,
    mutex: Arc<DistributedMutex>,
    config: LeaderConfig,
    state: watch::Sender<LeadershipState>,
    term: tokio::sync::Mutex<Option<Term>>,
}

impl LeaderLock {
    /// Create a leader lock for `name`. Nothing is acquired until
    /// [`LeaderLock::try_acquire`] is called.
    pub fn new(
        name: impl Into<String>,
        mutex: Arc<DistributedMutex>,
        config: LeaderConfig,
    ) -> Result<Self, CoordinationError> {
        config.validate()?;
        let (state, _) = watch::channel(LeadershipState::NotLeader);
        Ok(Self {
            name: name.into(),
            mutex,
            config,
            state,
            term: tokio::sync::Mutex::new(None),
        })
    }

    /// The role name. The lock key is `lock:{name}`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this process currently believes it leads.
    ///
    /// Becomes false as soon as a renewal is refused or fails.
    pub fn is_leader(&self) -> bool {
        *self.state.borrow() == LeadershipState::Leader
    }

    /// Watch leadership changes.
    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state.subscribe()
    }

    /// Try once to become leader.
    ///
    /// Returns true if this process leads after the call, including when it
    /// already did. On success a renewal task starts.
    pub async fn try_acquire(&self) -> bool {
        let mut term = self.term.lock().await;

        if let Some(current) = term.as_ref()
            && !current.renewal.is_finished()
        {
            return true;
        }
        // The renewal task exits only after losing the lock.
        if let Some(stale) = term.take() {
            stale.cancel.cancel();
            if let Err(e) = stale.renewal.await {
                warn!(name = %self.name, error = %e, "leader renewal task ended abnormally");
            }
        }

        let Some(handle) = self.mutex.try_acquire(&self.name, self.config.ttl).await else {
            debug!(name = %self.name, "leadership held elsewhere");
            self.state.send_replace(LeadershipState::NotLeader);
            return false;
        };

        let cancel = CancellationToken::new();
        let renewal = tokio::spawn(renew_until_lost(
            self.name.clone(),
            Arc::clone(&self.mutex),
            handle.clone(),
            self.config,
            cancel.clone(),
            self.state.clone(),
        ));
        self.state.send_replace(LeadershipState::Leader);
        info!(
            name = %self.name,
            backing = %handle.backing(),
            ttl_ms = self.config.ttl.as_millis() as u64,
            "leadership acquired"
        );
        *term = Some(Term {
            handle,
            cancel,
            renewal,
        });
        true
    }

    /// Give up leadership.
    ///
    /// Stops the renewal task and waits for it before deleting the lock.
    /// Calling this when not leading is a no-op.
    pub async fn release(&self) {
        let Some(term) = self.term.lock().await.take() else {
            return;
        };
        term.cancel.cancel();
        if let Err(e) = term.renewal.await {
            warn!(name = %self.name, error = %e, "leader renewal task ended abnormally");
        }
        self.mutex.release(&term.handle).await;
        self.state.send_replace(LeadershipState::NotLeader);
        info!(name = %self.name, "leadership released");
    }
}

impl Drop for LeaderLock {
    fn drop(&mut self) {
        let Ok(mut slot) = self.term.try_lock() else {
            return;
        };
        let Some(term) = slot.take() else {
            return;
        };
        term.cancel.cancel();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let mutex = Arc::clone(&self.mutex);
                let name = self.name.clone();
                runtime.spawn(async move {
                    if let Err(e) = term.renewal.await {
                        warn!(name = %name, error = %e, "leader renewal task ended abnormally");
                    }
                    mutex.release(&term.handle).await;
                });
            }
            Err(_) => {
                warn!(name = %self.name, "leader lock dropped outside a runtime, lock will expire by TTL");
            }
        }
    }
}

async fn renew_until_lost(
    name: String,
    mutex: Arc<DistributedMutex>,
    handle: LockHandle,
    config: LeaderConfig,
    cancel: CancellationToken,
    state: watch::Sender<LeadershipState>,
) {
    let interval = config.renewal_interval();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if !mutex.renew(&handle, config.ttl).await {
            warn!(name = %name, "leadership lost");
            state.send_replace(LeadershipState::NotLeader);
            return;
        }
    }
}
