//! Core domain types for robotline
//!
//! These types are the canonical model every other module works with. Raw
//! backend rows are mapped into them by [`crate::normalize`] before anything
//! downstream sees them.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Instance** | A long-running remote robot session the console converses with |
//! | **Timeline** | The ordered entries (logs, tool calls, plans) of one instance |
//! | **Optimistic entry** | A locally created entry shown before the backend confirms it |
//! | **Plan** | A server-tracked unit of work, optionally with steps |
//! | **Step** | One flattened item of a plan, used to drive progress views |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Instances
// ============================================

/// The key that scopes session state.
///
/// `Pending` is the "no instance yet" sentinel used while a new instance is
/// being bootstrapped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InstanceIdentity {
    #[default]
    Pending,
    Assigned(String),
}

impl InstanceIdentity {
    pub fn assigned(id: impl Into<String>) -> Self {
        InstanceIdentity::Assigned(id.into())
    }

    /// Build an identity from an optional id, treating blank ids as pending.
    pub fn from_option(id: Option<&str>) -> Self {
        match id {
            Some(id) if !id.trim().is_empty() => InstanceIdentity::Assigned(id.to_string()),
            _ => InstanceIdentity::Pending,
        }
    }

    pub fn instance_id(&self) -> Option<&str> {
        match self {
            InstanceIdentity::Pending => None,
            InstanceIdentity::Assigned(id) => Some(id),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, InstanceIdentity::Pending)
    }
}

impl std::fmt::Display for InstanceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceIdentity::Pending => write!(f, "<pending>"),
            InstanceIdentity::Assigned(id) => write!(f, "{}", id),
        }
    }
}

/// Lifecycle status of a remote instance as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Starting,
    Running,
    Active,
    Paused,
    Stopped,
    Failed,
    Error,
    /// Any status string this client does not know about
    Other(String),
}

impl InstanceStatus {
    pub fn as_str(&self) -> &str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Active => "active",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Error => "error",
            InstanceStatus::Other(s) => s,
        }
    }

    /// Parse a backend status string. Never fails; unknown values are kept.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => InstanceStatus::Pending,
            "starting" | "resuming" | "creating" => InstanceStatus::Starting,
            "running" => InstanceStatus::Running,
            "active" => InstanceStatus::Active,
            "paused" => InstanceStatus::Paused,
            "stopped" => InstanceStatus::Stopped,
            "failed" => InstanceStatus::Failed,
            "error" => InstanceStatus::Error,
            other => InstanceStatus::Other(other.to_string()),
        }
    }

    /// The instance can receive messages
    pub fn is_ready(&self) -> bool {
        matches!(self, InstanceStatus::Running | InstanceStatus::Active)
    }

    /// The instance will not become ready
    pub fn is_failed(&self) -> bool {
        matches!(self, InstanceStatus::Failed | InstanceStatus::Error)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An instance as listed by the backend directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub name: Option<String>,
    pub status: InstanceStatus,
    pub created_at: Option<DateTime<Utc>>,
}

// ============================================
// Timeline
// ============================================

/// Kind of timeline entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Message written by a person in the console
    UserAction,
    /// Status and bookkeeping output from the instance
    SystemMessage,
    /// Narrated action taken by the robot
    AgentAction,
    /// Request to invoke a tool
    ToolCall,
    /// Result of a tool invocation
    ToolResult,
    /// Error raised by the instance
    Error,
    /// A plan reached completion
    CompletedPlan,
    /// A kind this client does not recognize (raw value kept)
    Unrecognized(String),
}

impl EntryKind {
    pub fn as_str(&self) -> &str {
        match self {
            EntryKind::UserAction => "user_action",
            EntryKind::SystemMessage => "system",
            EntryKind::AgentAction => "agent_action",
            EntryKind::ToolCall => "tool_call",
            EntryKind::ToolResult => "tool_result",
            EntryKind::Error => "error",
            EntryKind::CompletedPlan => "completed_plan",
            EntryKind::Unrecognized(raw) => raw,
        }
    }

    /// Map a backend log type onto an entry kind.
    ///
    /// Both the current and older spellings are accepted.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user_action" | "user" | "user_message" => EntryKind::UserAction,
            "system" | "system_message" | "log" | "info" => EntryKind::SystemMessage,
            "agent_action" | "agent" | "assistant" | "robot" => EntryKind::AgentAction,
            "tool_call" | "tool_use" => EntryKind::ToolCall,
            "tool_result" | "tool_response" => EntryKind::ToolResult,
            "error" => EntryKind::Error,
            "completed_plan" | "plan_completed" => EntryKind::CompletedPlan,
            _ => EntryKind::Unrecognized(raw.to_string()),
        }
    }
}

/// Tool-specific part of a timeline entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPayload {
    /// Name of the tool that was invoked
    pub name: String,
    /// Opaque result payload (may contain media references or an error marker)
    pub result: Option<serde_json::Value>,
    /// Base64-encoded screenshot
    pub screenshot: Option<String>,
}

impl ToolPayload {
    /// Result is present and not an empty string/array/object/null
    pub fn has_result(&self) -> bool {
        match &self.result {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
            Some(serde_json::Value::Array(a)) => !a.is_empty(),
            Some(serde_json::Value::Object(o)) => !o.is_empty(),
            Some(_) => true,
        }
    }

    pub fn has_screenshot(&self) -> bool {
        self.screenshot.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Whether the result carries an error marker
    pub fn is_failure(&self) -> bool {
        let Some(serde_json::Value::Object(result)) = &self.result else {
            return false;
        };
        if result.get("error").is_some_and(|e| !e.is_null() && e != false) {
            return true;
        }
        if result.get("success") == Some(&serde_json::Value::Bool(false)) {
            return true;
        }
        matches!(
            result.get("status").and_then(|s| s.as_str()),
            Some("error") | Some("failed")
        )
    }
}

/// One unit of conversation history for an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    /// Unique within one instance timeline
    pub id: String,
    pub kind: EntryKind,
    pub created_at: DateTime<Utc>,
    /// Free-text body
    pub message: String,
    /// Structured details, kept opaque
    pub details: Option<serde_json::Map<String, serde_json::Value>>,
    /// Owning user, when the backend reports one
    pub user_id: Option<String>,
    pub tool: Option<ToolPayload>,
    /// Created locally and not yet confirmed by the backend
    pub temporary: bool,
    /// Rendered collapsed by default
    pub collapsed: bool,
}

impl TimelineEntry {
    pub fn is_user_action(&self) -> bool {
        self.kind == EntryKind::UserAction
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.tool.as_ref().map(|t| t.name.as_str())
    }

    pub fn has_details(&self) -> bool {
        self.details.as_ref().is_some_and(|d| !d.is_empty())
    }

    /// Has a tool name and something worth expanding: a result, details, or a screenshot
    pub fn is_tool_bearing(&self) -> bool {
        match &self.tool {
            Some(tool) if !tool.name.is_empty() => {
                tool.has_result() || self.has_details() || tool.has_screenshot()
            }
            _ => false,
        }
    }

    /// Whether this entry represents a failed action
    pub fn is_failure(&self) -> bool {
        self.kind == EntryKind::Error || self.tool.as_ref().is_some_and(|t| t.is_failure())
    }
}

// ============================================
// Plans
// ============================================

/// Kind of plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    Objective,
    Task,
    Verification,
    Milestone,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Objective => "objective",
            PlanType::Task => "task",
            PlanType::Verification => "verification",
            PlanType::Milestone => "milestone",
        }
    }
}

impl std::str::FromStr for PlanType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "objective" => Ok(PlanType::Objective),
            "task" => Ok(PlanType::Task),
            "verification" => Ok(PlanType::Verification),
            "milestone" => Ok(PlanType::Milestone),
            _ => Err(format!("unknown plan type: {}", s)),
        }
    }
}

/// Status of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Blocked,
    Paused,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Pending => "pending",
            PlanStatus::InProgress => "in_progress",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Cancelled => "cancelled",
            PlanStatus::Blocked => "blocked",
            PlanStatus::Paused => "paused",
        }
    }

    /// No further work will happen on the plan
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled
        )
    }
}

impl std::str::FromStr for PlanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PlanStatus::Pending),
            "in_progress" => Ok(PlanStatus::InProgress),
            "completed" => Ok(PlanStatus::Completed),
            "failed" => Ok(PlanStatus::Failed),
            "cancelled" | "canceled" => Ok(PlanStatus::Cancelled),
            "blocked" => Ok(PlanStatus::Blocked),
            "paused" => Ok(PlanStatus::Paused),
            _ => Err(format!("unknown plan status: {}", s)),
        }
    }
}

/// Status of a single plan step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
        }
    }

    /// Lenient parse: anything unknown counts as pending.
    pub fn parse(s: &str) -> Self {
        match s {
            "in_progress" | "running" | "active" => StepStatus::InProgress,
            "completed" | "done" | "finished" => StepStatus::Completed,
            _ => StepStatus::Pending,
        }
    }
}

impl From<PlanStatus> for StepStatus {
    fn from(status: PlanStatus) -> Self {
        match status {
            PlanStatus::InProgress => StepStatus::InProgress,
            PlanStatus::Completed => StepStatus::Completed,
            _ => StepStatus::Pending,
        }
    }
}

/// A server-tracked unit of work for an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstancePlan {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub plan_type: PlanType,
    pub status: PlanStatus,
    /// 0-100
    pub progress_percentage: u8,
    pub steps_total: u32,
    pub steps_completed: u32,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Raw step objects as stored by the backend
    pub steps: Option<serde_json::Value>,
}

/// Flattened view of one plan step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: StepStatus,
    pub order: i64,
    /// Plan this step belongs to
    pub plan_id: String,
}

// ============================================
// Change feed
// ============================================

/// Table a change-feed event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedTable {
    Logs,
    Plans,
}

impl FeedTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedTable::Logs => "instance_logs",
            FeedTable::Plans => "instance_plans",
        }
    }
}

/// One change delivered by the push feed. Rows are raw backend JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Insert {
        table: FeedTable,
        row: serde_json::Value,
    },
    Update {
        table: FeedTable,
        row: serde_json::Value,
    },
    Delete {
        table: FeedTable,
        id: String,
    },
}

impl FeedEvent {
    pub fn table(&self) -> FeedTable {
        match self {
            FeedEvent::Insert { table, .. }
            | FeedEvent::Update { table, .. }
            | FeedEvent::Delete { table, .. } => *table,
        }
    }
}
