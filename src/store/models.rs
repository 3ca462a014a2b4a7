use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureStatus {
    Pending,
    InProgress,
    Done,
    Blocked,
}

impl FeatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureStatus::Pending => "PENDING",
            FeatureStatus::InProgress => "IN_PROGRESS",
            FeatureStatus::Done => "DONE",
            FeatureStatus::Blocked => "BLOCKED",
        }
    }
}

impl std::str::FromStr for FeatureStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(FeatureStatus::Pending),
            "IN_PROGRESS" => Ok(FeatureStatus::InProgress),
            "DONE" => Ok(FeatureStatus::Done),
            "BLOCKED" => Ok(FeatureStatus::Blocked),
            other => Err(anyhow::anyhow!("unknown feature status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewStatus {
    Pending,
    ReadyForVerification,
    Verified,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "PENDING",
            ReviewStatus::ReadyForVerification => "READY_FOR_VERIFICATION",
            ReviewStatus::Verified => "VERIFIED",
        }
    }
}

impl std::str::FromStr for ReviewStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ReviewStatus::Pending),
            "READY_FOR_VERIFICATION" => Ok(ReviewStatus::ReadyForVerification),
            "VERIFIED" => Ok(ReviewStatus::Verified),
            other => Err(anyhow::anyhow!("unknown review status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub category: String,
    pub steps: Vec<String>,
    pub priority: i64,
    pub status: String,
    pub passes: bool,
    pub review_status: String,
    pub assigned_agent_id: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub branch_name: Option<String>,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error_key: Option<String>,
    pub same_error_streak: i64,
    pub last_artifact_path: Option<String>,
    pub last_diff_fingerprint: Option<String>,
    pub same_diff_streak: i64,
    pub qa_attempts: i64,
    pub last_blocked_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFeature {
    pub name: String,
    pub description: String,
    pub category: String,
    pub steps: Vec<String>,
    pub priority: i64,
    pub depends_on: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Active,
    Completed,
    Crashed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "ACTIVE",
            AgentStatus::Completed => "COMPLETED",
            AgentStatus::Crashed => "CRASHED",
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(AgentStatus::Active),
            "COMPLETED" => Ok(AgentStatus::Completed),
            "CRASHED" => Ok(AgentStatus::Crashed),
            other => Err(anyhow::anyhow!("unknown agent status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeat {
    pub agent_id: String,
    pub last_ping: DateTime<Utc>,
    pub status: String,
    pub worktree_path: Option<String>,
    pub feature_id: Option<i64>,
    pub pid: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub process_created_at: Option<DateTime<Utc>>,
    pub start_ticks: Option<i64>,
    pub api_port: Option<i64>,
    pub web_port: Option<i64>,
    pub log_file_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub branch_name: String,
    pub feature_id: i64,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
    pub commit_hash: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub pending: i64,
    pub in_progress: i64,
    pub done: i64,
    pub blocked: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Progress {
    pub total: i64,
    pub done: i64,
    pub fraction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingQueueState {
    pub pending_total: i64,
    pub claimable_now: i64,
    pub waiting_backoff: i64,
    pub waiting_deps: i64,
    pub earliest_next_attempt_at: Option<DateTime<Utc>>,
    pub example_dep_blocked_feature: Option<i64>,
}
