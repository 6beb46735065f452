//! Instance lifecycle poller
//!
//! After an instance is created or resumed, its status is checked on a fixed
//! delay until it is usable, it fails, or the attempt ceiling is hit:
//!
//! ```text
//!   sleep(interval) ─► query ─┬─ running/active ─► clear thinking, Navigate ─► Ready
//!        ▲                    ├─ failed/error ───► clear thinking, notice ───► Failed
//!        │                    └─ anything else ──┐
//!        └───────────── attempt < max ◄──────────┘
//!                         attempt == max ─► clear thinking, notice ─► Exhausted
//! ```
//!
//! Only one loop runs at a time. A second start while one is running returns
//! [`PollOutcome::AlreadyRunning`] and touches nothing. Navigation and notices
//! are only emitted while the request's owner is still the open instance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::signals::{NoticeLevel, SessionSignal, SignalSender};
use super::thinking::{ClearReason, ThinkingTracker};
use crate::backend::InstanceDirectory;
use crate::config::SessionConfig;
use crate::error::Result;
use crate::types::{InstanceIdentity, InstanceRecord};

/// How the instance is looked up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollTarget {
    ById(String),
    /// Brand-new instance whose id is not known yet
    ByName { site_id: String, name: String },
}

impl std::fmt::Display for PollTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollTarget::ById(id) => write!(f, "id={}", id),
            PollTarget::ByName { site_id, name } => write!(f, "site={} name={}", site_id, name),
        }
    }
}

/// Answers whether `owner` is still the instance the session shows
pub type OwnerCheck = Arc<dyn Fn(&InstanceIdentity) -> bool + Send + Sync>;

/// One polling job
#[derive(Clone)]
pub struct PollRequest {
    pub target: PollTarget,
    /// Tracker to clear when polling stops
    pub thinking: ThinkingTracker,
    /// Owner the tracker was started for
    pub owner: InstanceIdentity,
    /// Emit [`SessionSignal::Navigate`] when the instance comes up
    pub navigate: bool,
    pub is_active: OwnerCheck,
}

impl PollRequest {
    /// A request whose owner always counts as active.
    pub fn new(target: PollTarget, thinking: ThinkingTracker, owner: InstanceIdentity) -> Self {
        Self {
            target,
            thinking,
            owner,
            navigate: false,
            is_active: Arc::new(|_| true),
        }
    }

    pub fn navigating(mut self) -> Self {
        self.navigate = true;
        self
    }

    pub fn while_active(mut self, check: OwnerCheck) -> Self {
        self.is_active = check;
        self
    }

    fn owner_active(&self) -> bool {
        let active = (self.is_active)(&self.owner);
        if !active {
            tracing::debug!(owner = %self.owner, "Poll owner is no longer open, staying quiet");
        }
        active
    }
}

impl std::fmt::Debug for PollRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollRequest")
            .field("target", &self.target)
            .field("owner", &self.owner)
            .field("navigate", &self.navigate)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Ready { instance_id: String, attempts: u32 },
    Failed { status: String, attempts: u32 },
    Exhausted { attempts: u32 },
    AlreadyRunning,
}

#[derive(Clone)]
pub struct LifecyclePoller {
    directory: Arc<dyn InstanceDirectory>,
    signals: SignalSender,
    interval: Duration,
    max_attempts: u32,
    starting: Arc<AtomicBool>,
}

impl std::fmt::Debug for LifecyclePoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecyclePoller")
            .field("interval", &self.interval)
            .field("max_attempts", &self.max_attempts)
            .field("starting", &self.is_running())
            .finish()
    }
}

/// Resets the "starting" flag however the loop ends, including abort.
struct StartingGuard(Arc<AtomicBool>);

impl Drop for StartingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl LifecyclePoller {
    pub fn new(
        directory: Arc<dyn InstanceDirectory>,
        signals: SignalSender,
        interval: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            directory,
            signals,
            interval,
            max_attempts,
            starting: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_config(
        directory: Arc<dyn InstanceDirectory>,
        signals: SignalSender,
        config: &SessionConfig,
    ) -> Self {
        Self::new(
            directory,
            signals,
            config.poll_interval(),
            config.max_poll_attempts,
        )
    }

    /// A poll loop is in flight
    pub fn is_running(&self) -> bool {
        self.starting.load(Ordering::SeqCst)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Poll until the instance is ready, has failed, or attempts run out.
    pub async fn run(&self, request: PollRequest) -> PollOutcome {
        if self
            .starting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(poll_target = %request.target, "Poll loop already running");
            return PollOutcome::AlreadyRunning;
        }
        let _guard = StartingGuard(Arc::clone(&self.starting));

        tracing::info!(
            poll_target = %request.target,
            interval_ms = self.interval.as_millis() as u64,
            max_attempts = self.max_attempts,
            "Polling instance status"
        );

        for attempt in 1..=self.max_attempts {
            tokio::time::sleep(self.interval).await;

            let record = match self.query(&request.target).await {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(
                        poll_target = %request.target,
                        attempt,
                        error = %e,
                        "Instance status query failed"
                    );
                    continue;
                }
            };

            let Some(record) = record else {
                tracing::debug!(poll_target = %request.target, attempt, "Instance not visible yet");
                continue;
            };

            tracing::debug!(
                instance = %record.id,
                status = %record.status,
                attempt,
                "Instance status"
            );

            if record.status.is_ready() {
                tracing::info!(instance = %record.id, attempt, "Instance is running");
                request
                    .thinking
                    .clear(&request.owner, ClearReason::InstanceReady);
                if request.navigate && request.owner_active() {
                    self.signals.emit(SessionSignal::Navigate {
                        instance_id: record.id.clone(),
                    });
                }
                return PollOutcome::Ready {
                    instance_id: record.id,
                    attempts: attempt,
                };
            }

            if record.status.is_failed() {
                tracing::warn!(instance = %record.id, status = %record.status, "Instance failed to start");
                request
                    .thinking
                    .clear(&request.owner, ClearReason::InstanceFailed);
                if request.owner_active() {
                    self.signals.notify(
                        NoticeLevel::Error,
                        format!("The robot failed to start (status: {})", record.status),
                    );
                }
                return PollOutcome::Failed {
                    status: record.status.as_str().to_string(),
                    attempts: attempt,
                };
            }
        }

        tracing::warn!(
            poll_target = %request.target,
            attempts = self.max_attempts,
            "Gave up waiting for instance"
        );
        request
            .thinking
            .clear(&request.owner, ClearReason::InstanceFailed);
        if request.owner_active() {
            self.signals.notify(
                NoticeLevel::Error,
                "The robot did not start in time. Please try again.",
            );
        }
        PollOutcome::Exhausted {
            attempts: self.max_attempts,
        }
    }

    async fn query(&self, target: &PollTarget) -> Result<Option<InstanceRecord>> {
        match target {
            PollTarget::ById(id) => self.directory.instance_status(id).await,
            PollTarget::ByName { site_id, name } => {
                self.directory.find_instance_by_name(site_id, name).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::session::signals::Notice;
    use crate::session::thinking::ThinkingScope;
    use crate::types::InstanceStatus;

    fn poller(backend: &Arc<MemoryBackend>, signals: &SignalSender, max_attempts: u32) -> LifecyclePoller {
        LifecyclePoller::new(
            backend.clone(),
            signals.clone(),
            Duration::from_millis(1500),
            max_attempts,
        )
    }

    fn by_name(thinking: &ThinkingTracker) -> PollRequest {
        PollRequest::new(
            PollTarget::ByName {
                site_id: "site-1".to_string(),
                name: "robot".to_string(),
            },
            thinking.clone(),
            InstanceIdentity::Pending,
        )
        .navigating()
    }

    fn notices(rx: &mut tokio::sync::broadcast::Receiver<SessionSignal>) -> Vec<Notice> {
        let mut out = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            if let SessionSignal::Notice(notice) = signal {
                out.push(notice);
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn ready_on_third_attempt_navigates() {
        let backend = Arc::new(MemoryBackend::new());
        backend.script_named_instance(
            "site-1",
            "robot",
            "inst-42",
            &[InstanceStatus::Pending, InstanceStatus::Pending, InstanceStatus::Running],
        );
        let signals = SignalSender::new();
        let mut rx = signals.subscribe();
        let thinking = ThinkingTracker::detached(ThinkingScope::Bootstrap, Duration::from_secs(600));
        thinking.start(InstanceIdentity::Pending);

        let outcome = poller(&backend, &signals, 40).run(by_name(&thinking)).await;

        assert_eq!(
            outcome,
            PollOutcome::Ready {
                instance_id: "inst-42".to_string(),
                attempts: 3
            }
        );
        assert_eq!(backend.status_query_count(), 3);
        assert!(!thinking.is_thinking());
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionSignal::Navigate {
                instance_id: "inst-42".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_status_notifies_once() {
        let backend = Arc::new(MemoryBackend::new());
        backend.script_instance("inst-1", &[InstanceStatus::Starting, InstanceStatus::Failed]);
        let signals = SignalSender::new();
        let mut rx = signals.subscribe();
        let thinking = ThinkingTracker::detached(ThinkingScope::Existing, Duration::from_secs(600));
        let owner = InstanceIdentity::assigned("inst-1");
        thinking.start(owner.clone());

        let outcome = poller(&backend, &signals, 40)
            .run(PollRequest::new(
                PollTarget::ById("inst-1".to_string()),
                thinking.clone(),
                owner,
            ))
            .await;

        assert!(matches!(outcome, PollOutcome::Failed { attempts: 2, .. }));
        assert!(!thinking.is_thinking());
        assert_eq!(notices(&mut rx).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_after_max_attempts() {
        let backend = Arc::new(MemoryBackend::new());
        backend.script_named_instance("site-1", "robot", "inst-7", &[InstanceStatus::Pending]);
        let signals = SignalSender::new();
        let mut rx = signals.subscribe();
        let thinking = ThinkingTracker::detached(ThinkingScope::Bootstrap, Duration::from_secs(600));
        thinking.start(InstanceIdentity::Pending);

        let poller = poller(&backend, &signals, 40);
        let outcome = poller.run(by_name(&thinking)).await;

        assert_eq!(outcome, PollOutcome::Exhausted { attempts: 40 });
        assert_eq!(backend.status_query_count(), 40);
        assert_eq!(notices(&mut rx).len(), 1);
        assert!(!thinking.is_thinking());
        assert!(!poller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn query_errors_consume_attempts() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_status_queries(true);
        let signals = SignalSender::new();
        let thinking = ThinkingTracker::detached(ThinkingScope::Bootstrap, Duration::from_secs(600));

        let outcome = poller(&backend, &signals, 3).run(by_name(&thinking)).await;

        assert_eq!(outcome, PollOutcome::Exhausted { attempts: 3 });
        assert_eq!(backend.status_query_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected_while_running() {
        let backend = Arc::new(MemoryBackend::new());
        backend.script_named_instance(
            "site-1",
            "robot",
            "inst-1",
            &[InstanceStatus::Pending, InstanceStatus::Running],
        );
        let signals = SignalSender::new();
        let thinking = ThinkingTracker::detached(ThinkingScope::Bootstrap, Duration::from_secs(600));
        let poller = poller(&backend, &signals, 40);

        let first = {
            let poller = poller.clone();
            let request = by_name(&thinking);
            tokio::spawn(async move { poller.run(request).await })
        };
        tokio::task::yield_now().await;
        assert!(poller.is_running());

        assert_eq!(poller.run(by_name(&thinking)).await, PollOutcome::AlreadyRunning);

        let outcome = first.await.unwrap();
        assert!(matches!(outcome, PollOutcome::Ready { ref instance_id, .. } if instance_id == "inst-1"));
        assert!(!poller.is_running());
        assert_eq!(backend.status_query_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_owner_gets_no_navigate_or_notice() {
        let backend = Arc::new(MemoryBackend::new());
        backend.script_named_instance("site-1", "robot", "inst-9", &[InstanceStatus::Running]);
        backend.script_instance("inst-2", &[InstanceStatus::Starting]);
        let signals = SignalSender::new();
        let mut rx = signals.subscribe();
        let thinking = ThinkingTracker::detached(ThinkingScope::Bootstrap, Duration::from_secs(600));
        thinking.start(InstanceIdentity::Pending);
        let closed: OwnerCheck = Arc::new(|_| false);

        let ready = poller(&backend, &signals, 5)
            .run(by_name(&thinking).while_active(closed.clone()))
            .await;
        let exhausted = poller(&backend, &signals, 5)
            .run(
                PollRequest::new(
                    PollTarget::ById("inst-2".to_string()),
                    thinking.clone(),
                    InstanceIdentity::assigned("inst-2"),
                )
                .while_active(closed),
            )
            .await;

        assert!(matches!(ready, PollOutcome::Ready { .. }));
        assert_eq!(exhausted, PollOutcome::Exhausted { attempts: 5 });
        assert!(!thinking.is_thinking());
        assert!(rx.try_recv().is_err());
    }
}
