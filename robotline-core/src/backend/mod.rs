//! Collaborator seams to the hosted backend
//!
//! The coordinator never talks HTTP directly. It depends on five small
//! traits, bundled in [`Collaborators`]:
//!
//! | Trait | Used for |
//! |-------|----------|
//! | [`ActionApi`] | sending messages and creating instances |
//! | [`InstanceDirectory`] | lifecycle polling |
//! | [`TimelineStore`] | loading the first page of an instance |
//! | [`PlanStore`] | plan and step mutations |
//! | [`ChangeFeed`] | live insert/update/delete events |
//!
//! [`MemoryBackend`] implements all of them in process; [`RestBackend`]
//! consumes a PostgREST-style HTTP surface.

pub mod memory;
pub mod rest;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{FeedEvent, InstanceRecord, InstanceStatus, PlanStatus};

pub use memory::MemoryBackend;
pub use rest::RestBackend;

/// Receiving half of a change-feed subscription
pub type FeedReceiver = mpsc::Receiver<Result<FeedEvent>>;

/// Buffer size of feed channels
pub const FEED_CHANNEL_CAPACITY: usize = 256;

/// Body of "send message to an existing instance"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub instance_id: String,
    pub message: String,
    pub site_id: String,
    /// Serialized session context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub activity: String,
}

/// Body of "create/start a new instance"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    pub site_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub activity: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Name the instance can be found by before its id is known
    pub name: String,
}

/// Response of either action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    #[serde(default, alias = "instanceId")]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Logical error reported by the backend, shown verbatim
    #[serde(default)]
    pub error: Option<String>,
}

impl ActionResponse {
    pub fn status(&self) -> Option<InstanceStatus> {
        self.status.as_deref().map(InstanceStatus::parse)
    }
}

#[async_trait]
pub trait ActionApi: Send + Sync {
    async fn send_message(&self, request: SendMessageRequest) -> Result<ActionResponse>;

    async fn create_instance(&self, request: CreateInstanceRequest) -> Result<ActionResponse>;
}

#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    /// `None` when no such instance exists (yet)
    async fn instance_status(&self, instance_id: &str) -> Result<Option<InstanceRecord>>;

    /// Most recent instance on `site_id` called `name`
    async fn find_instance_by_name(
        &self,
        site_id: &str,
        name: &str,
    ) -> Result<Option<InstanceRecord>>;
}

#[async_trait]
pub trait TimelineStore: Send + Sync {
    /// Up to `limit` of the newest raw log rows
    async fn fetch_timeline(&self, instance_id: &str, limit: usize) -> Result<Vec<Value>>;

    async fn fetch_plans(&self, instance_id: &str) -> Result<Vec<Value>>;
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn update_plan_status(&self, plan_id: &str, status: PlanStatus) -> Result<()>;

    async fn update_plan_steps(&self, plan_id: &str, steps: Value) -> Result<()>;
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Start delivering log and plan changes for one instance.
    ///
    /// Dropping the receiver ends the subscription.
    async fn subscribe(&self, instance_id: &str) -> Result<FeedReceiver>;
}

/// The set of backend capabilities the coordinator is built with
#[derive(Clone)]
pub struct Collaborators {
    pub actions: Arc<dyn ActionApi>,
    pub directory: Arc<dyn InstanceDirectory>,
    pub timeline: Arc<dyn TimelineStore>,
    pub plans: Arc<dyn PlanStore>,
    pub feed: Arc<dyn ChangeFeed>,
}

impl Collaborators {
    /// Use one backend for every capability.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: ActionApi + InstanceDirectory + TimelineStore + PlanStore + ChangeFeed + 'static,
    {
        Self {
            actions: backend.clone(),
            directory: backend.clone(),
            timeline: backend.clone(),
            plans: backend.clone(),
            feed: backend,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
