//! Thinking/waiting state machine
//!
//! ```text
//!            start(owner)                      clear(owner) / expiry / identity change
//!   Idle ─────────────────► Thinking(owner) ───────────────────────────────────────► Idle
//! ```
//!
//! Every state carries the [`InstanceIdentity`] that owns it. A clear request
//! for a different owner is a no-op, so a stale timer or a late callback from
//! a previous instance can never hide the current instance's indicator.
//!
//! Each tracker holds at most one expiry timer. Starting again aborts the old
//! timer, and timers are tagged with a generation so one that already fired
//! but lost the race for the lock is ignored.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::types::InstanceIdentity;

/// Which of the two independent trackers a state belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThinkingScope {
    /// Waiting on an instance that already exists
    Existing,
    /// Waiting on a brand-new instance to come up
    Bootstrap,
}

impl ThinkingScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThinkingScope::Existing => "existing",
            ThinkingScope::Bootstrap => "bootstrap",
        }
    }
}

/// Why a tracker went back to idle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearReason {
    /// A qualifying response arrived
    Response,
    /// The safety timeout fired
    Expired,
    /// The request failed or the session was closed
    Cancelled,
    /// The active instance changed away from the owner
    IdentityChanged,
    /// The instance came up
    InstanceReady,
    /// The instance failed or never came up
    InstanceFailed,
}

impl ClearReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClearReason::Response => "response",
            ClearReason::Expired => "expired",
            ClearReason::Cancelled => "cancelled",
            ClearReason::IdentityChanged => "identity_changed",
            ClearReason::InstanceReady => "instance_ready",
            ClearReason::InstanceFailed => "instance_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThinkingState {
    Idle,
    Thinking {
        owner: InstanceIdentity,
        since: Instant,
    },
}

/// Called after every transition to idle, outside the tracker's lock.
pub type IdleHook = Arc<dyn Fn(ThinkingScope, &InstanceIdentity, ClearReason) + Send + Sync>;

struct TrackerInner {
    state: ThinkingState,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// One thinking indicator with its expiry timer.
///
/// Cloning yields another handle to the same tracker.
#[derive(Clone)]
pub struct ThinkingTracker {
    scope: ThinkingScope,
    timeout: Duration,
    inner: Arc<Mutex<TrackerInner>>,
    on_idle: IdleHook,
}

impl std::fmt::Debug for ThinkingTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThinkingTracker")
            .field("scope", &self.scope)
            .field("timeout", &self.timeout)
            .field("state", &self.state())
            .finish()
    }
}

impl ThinkingTracker {
    pub fn new(scope: ThinkingScope, timeout: Duration, on_idle: IdleHook) -> Self {
        Self {
            scope,
            timeout,
            inner: Arc::new(Mutex::new(TrackerInner {
                state: ThinkingState::Idle,
                generation: 0,
                timer: None,
            })),
            on_idle,
        }
    }

    /// A tracker whose idle transitions have no side effects.
    pub fn detached(scope: ThinkingScope, timeout: Duration) -> Self {
        Self::new(scope, timeout, Arc::new(|_, _, _| {}))
    }

    pub fn scope(&self) -> ThinkingScope {
        self.scope
    }

    /// Enter `Thinking(owner)` and arm the expiry timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, owner: InstanceIdentity) {
        let mut inner = self.lock();
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.generation += 1;
        let generation = inner.generation;

        tracing::debug!(
            scope = self.scope.as_str(),
            owner = %owner,
            generation,
            "Thinking started"
        );

        inner.state = ThinkingState::Thinking {
            owner,
            since: Instant::now(),
        };

        let weak = Arc::downgrade(&self.inner);
        let hook = Arc::clone(&self.on_idle);
        let scope = self.scope;
        let timeout = self.timeout;
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expire(weak, generation, scope, hook);
        }));
    }

    /// Return to idle if `owner` is the current owner. Returns whether a
    /// transition happened.
    pub fn clear(&self, owner: &InstanceIdentity, reason: ClearReason) -> bool {
        let cleared = {
            let mut inner = self.lock();
            let current = match &inner.state {
                ThinkingState::Thinking { owner: current, .. } => Some(current.clone()),
                ThinkingState::Idle => None,
            };
            match current {
                Some(current) if &current == owner => {
                    inner.state = ThinkingState::Idle;
                    if let Some(timer) = inner.timer.take() {
                        timer.abort();
                    }
                    true
                }
                Some(current) => {
                    tracing::debug!(
                        scope = self.scope.as_str(),
                        owner = %current,
                        requested = %owner,
                        reason = reason.as_str(),
                        "Ignoring clear for a different owner"
                    );
                    false
                }
                None => false,
            }
        };

        if cleared {
            tracing::debug!(
                scope = self.scope.as_str(),
                owner = %owner,
                reason = reason.as_str(),
                "Thinking cleared"
            );
            (self.on_idle)(self.scope, owner, reason);
        }
        cleared
    }

    /// Drop a state owned by anyone other than `keep`.
    pub fn release_unless(&self, keep: &InstanceIdentity) -> bool {
        match self.owner() {
            Some(owner) if &owner != keep => self.clear(&owner, ClearReason::IdentityChanged),
            _ => false,
        }
    }

    /// Drop any state regardless of owner.
    pub fn release(&self, reason: ClearReason) -> bool {
        match self.owner() {
            Some(owner) => self.clear(&owner, reason),
            None => false,
        }
    }

    pub fn state(&self) -> ThinkingState {
        self.lock().state.clone()
    }

    pub fn owner(&self) -> Option<InstanceIdentity> {
        match &self.lock().state {
            ThinkingState::Thinking { owner, .. } => Some(owner.clone()),
            ThinkingState::Idle => None,
        }
    }

    pub fn is_thinking(&self) -> bool {
        matches!(self.lock().state, ThinkingState::Thinking { .. })
    }

    pub fn is_thinking_for(&self, owner: &InstanceIdentity) -> bool {
        matches!(&self.lock().state, ThinkingState::Thinking { owner: current, .. } if current == owner)
    }

    /// Whether an expiry timer is armed and has not yet run.
    pub fn has_pending_timer(&self) -> bool {
        self.lock()
            .timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        lock_inner(&self.inner)
    }
}

fn lock_inner(inner: &Mutex<TrackerInner>) -> MutexGuard<'_, TrackerInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn expire(weak: Weak<Mutex<TrackerInner>>, generation: u64, scope: ThinkingScope, hook: IdleHook) {
    let Some(inner) = weak.upgrade() else {
        return;
    };

    let expired_owner = {
        let mut guard = lock_inner(&inner);
        if guard.generation != generation {
            return;
        }
        match std::mem::replace(&mut guard.state, ThinkingState::Idle) {
            ThinkingState::Thinking { owner, .. } => {
                guard.timer = None;
                Some(owner)
            }
            ThinkingState::Idle => None,
        }
    };

    if let Some(owner) = expired_owner {
        tracing::warn!(
            scope = scope.as_str(),
            owner = %owner,
            "Thinking expired without a response"
        );
        hook(scope, &owner, ClearReason::Expired);
    }
}
