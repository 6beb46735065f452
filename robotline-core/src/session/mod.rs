//! Instance session coordination
//!
//! ## Architecture
//!
//! ```text
//!                ┌──────────────────────────────────────────────┐
//!  send_message ─►              SessionCoordinator              │
//!                │                                              │
//!                │  OptimisticBuffer ──► Timeline ◄── EventStreamMerger ◄── ChangeFeed
//!                │        │                                 │   │
//!                │        ▼                                 ▼   │
//!                │  ThinkingTracker (existing) ◄──── response   │
//!                │  ThinkingTracker (bootstrap) ◄─┐             │
//!                │                                │             │
//!                │  LifecyclePoller ──────────────┘ ◄── InstanceDirectory
//!                └──────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//!                        broadcast<SessionSignal>
//! ```
//!
//! Components are built leaves first: the buffer and trackers have no
//! dependencies, the merger needs both, the poller needs a tracker to clear,
//! and the coordinator composes all of them. Capabilities are passed in
//! through constructors.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use robotline_core::backend::{Collaborators, MemoryBackend};
//! use robotline_core::session::{SessionContext, SessionCoordinator};
//! use robotline_core::{Config, InstanceIdentity};
//!
//! let config = Config::load()?;
//! let backend = Collaborators::from_backend(Arc::new(MemoryBackend::new()));
//! let session = SessionCoordinator::new(
//!     config.session.clone(),
//!     backend,
//!     SessionContext::new("site-1", &config.session.activity),
//! );
//!
//! session.open_instance(InstanceIdentity::assigned("abc")).await?;
//! session.send_message("Check the contact form").await;
//! ```

pub mod coordinator;
pub mod groups;
pub mod merger;
pub mod optimistic;
pub mod plans;
pub mod poller;
pub mod signals;
pub mod state;
pub mod thinking;
pub mod timeline;

pub use coordinator::{IgnoreReason, SendOutcome, SessionCoordinator, SessionSnapshot};
pub use groups::{group_tool_calls, TimelineItem, ToolCallGroup};
pub use merger::{
    CollapsePolicy, EventStreamMerger, FeedSubscription, MergeAction, MergeOutcome, ResponsePolicy,
};
pub use optimistic::{is_temporary_id, OptimisticBuffer, TEMP_ID_PREFIX};
pub use plans::{categorize_plans, dedupe_steps, derive_steps, PlanBuckets};
pub use poller::{LifecyclePoller, OwnerCheck, PollOutcome, PollRequest, PollTarget};
pub use signals::{Notice, NoticeLevel, SessionSignal, SignalSender};
pub use state::{SessionContext, SessionState};
pub use thinking::{ClearReason, IdleHook, ThinkingScope, ThinkingState, ThinkingTracker};
pub use timeline::Timeline;
