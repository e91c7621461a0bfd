//! Record envelope and entity payload definitions.
//!
//! Every entity lives in its own file as a `RecordEnvelope`: a header carrying
//! the payload checksum and an append-only signature list, wrapped around a
//! type-specific payload. Derived data (enriched tasks, the index snapshot)
//! is defined in `plugins::indexer` and never appears here.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CURRENT_SCHEMA_VERSION: &str = "1.1";
/// Header versions with a defined migration to `CURRENT_SCHEMA_VERSION`.
pub const LEGACY_SCHEMA_VERSIONS: &[&str] = &["1.0"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Task,
    Cycle,
    Feedback,
    Execution,
    Changelog,
    Actor,
    Agent,
}

impl RecordType {
    pub const ALL: [RecordType; 7] = [
        RecordType::Task,
        RecordType::Cycle,
        RecordType::Feedback,
        RecordType::Execution,
        RecordType::Changelog,
        RecordType::Actor,
        RecordType::Agent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::Task => "task",
            RecordType::Cycle => "cycle",
            RecordType::Feedback => "feedback",
            RecordType::Execution => "execution",
            RecordType::Changelog => "changelog",
            RecordType::Actor => "actor",
            RecordType::Agent => "agent",
        }
    }

    /// Store directory, `<type>s`.
    pub fn dir_name(self) -> &'static str {
        match self {
            RecordType::Task => "tasks",
            RecordType::Cycle => "cycles",
            RecordType::Feedback => "feedbacks",
            RecordType::Execution => "executions",
            RecordType::Changelog => "changelogs",
            RecordType::Actor => "actors",
            RecordType::Agent => "agents",
        }
    }

    pub fn from_dir_name(dir: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.dir_name() == dir)
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Actors and agents use prefixed ids (`human:ada`) instead of time-sortable ones.
    pub fn uses_actor_ids(self) -> bool {
        matches!(self, RecordType::Actor | RecordType::Agent)
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    pub key_id: String,
    pub role: String,
    pub timestamp: u64,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordHeader {
    pub schema_version: String,
    pub record_type: RecordType,
    pub payload_checksum: String,
    pub signatures: Vec<Signature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEnvelope<P> {
    pub header: RecordHeader,
    pub payload: P,
}

impl<P> RecordEnvelope<P> {
    /// Most recently appended signature; the one that must verify against the payload.
    pub fn latest_signature(&self) -> Option<&Signature> {
        self.header.signatures.last()
    }

    /// Latest signature timestamp, i.e. when the record last changed hands.
    pub fn last_signed_at(&self) -> Option<u64> {
        self.header.signatures.iter().map(|s| s.timestamp).max()
    }

    /// First signature, i.e. creation.
    pub fn created_at(&self) -> Option<u64> {
        self.header.signatures.iter().map(|s| s.timestamp).min()
    }

    /// New envelope with `signature` appended. Existing entries are kept untouched.
    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.header.signatures.push(signature);
        self
    }
}

/// Implemented by every stored payload type.
pub trait RecordPayload: Serialize + DeserializeOwned + Clone + Send + Sync {
    const RECORD_TYPE: RecordType;

    fn id(&self) -> &str;

    /// Human label used in activity history.
    fn label(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Draft,
    Review,
    Ready,
    Active,
    Paused,
    Done,
    Discarded,
    Archived,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Draft,
        TaskStatus::Review,
        TaskStatus::Ready,
        TaskStatus::Active,
        TaskStatus::Paused,
        TaskStatus::Done,
        TaskStatus::Discarded,
        TaskStatus::Archived,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Draft => "draft",
            TaskStatus::Review => "review",
            TaskStatus::Ready => "ready",
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Done => "done",
            TaskStatus::Discarded => "discarded",
            TaskStatus::Archived => "archived",
        }
    }

    /// Statuses in which elapsed time without activity means the work is stalling.
    pub fn is_active_like(self) -> bool {
        matches!(
            self,
            TaskStatus::Active | TaskStatus::Review | TaskStatus::Paused
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Discarded | TaskStatus::Archived
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form references; `task:<id>` entries are dependencies.
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub cycle_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl TaskRecord {
    pub const DEPENDENCY_PREFIX: &'static str = "task:";

    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.references
            .iter()
            .filter_map(|r| r.strip_prefix(Self::DEPENDENCY_PREFIX))
    }
}

impl RecordPayload for TaskRecord {
    const RECORD_TYPE: RecordType = RecordType::Task;
    fn id(&self) -> &str {
        &self.id
    }
    fn label(&self) -> &str {
        &self.title
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    Planning,
    Active,
    Completed,
    Archived,
}

impl CycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CycleStatus::Planning => "planning",
            CycleStatus::Active => "active",
            CycleStatus::Completed => "completed",
            CycleStatus::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleRecord {
    pub id: String,
    pub title: String,
    pub status: CycleStatus,
    #[serde(default)]
    pub task_ids: Vec<String>,
    #[serde(default)]
    pub child_cycle_ids: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl RecordPayload for CycleRecord {
    const RECORD_TYPE: RecordType = RecordType::Cycle;
    fn id(&self) -> &str {
        &self.id
    }
    fn label(&self) -> &str {
        &self.title
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackType {
    Blocking,
    Question,
    Suggestion,
    Assignment,
    Approval,
    Clarification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackStatus {
    Open,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRecord {
    pub id: String,
    pub entity_type: RecordType,
    pub entity_id: String,
    #[serde(rename = "type")]
    pub feedback_type: FeedbackType,
    pub status: FeedbackStatus,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolves_feedback_id: Option<String>,
}

impl FeedbackRecord {
    pub fn is_open(&self) -> bool {
        self.status == FeedbackStatus::Open
    }
}

impl RecordPayload for FeedbackRecord {
    const RECORD_TYPE: RecordType = RecordType::Feedback;
    fn id(&self) -> &str {
        &self.id
    }
    fn label(&self) -> &str {
        &self.content
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionType {
    Analysis,
    Progress,
    Blocker,
    Completion,
    Info,
    Correction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: String,
    pub task_id: String,
    #[serde(rename = "type")]
    pub execution_type: ExecutionType,
    pub title: String,
    #[serde(default)]
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub references: Vec<String>,
}

impl RecordPayload for ExecutionRecord {
    const RECORD_TYPE: RecordType = RecordType::Execution;
    fn id(&self) -> &str {
        &self.id
    }
    fn label(&self) -> &str {
        &self.title
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Creation,
    Completion,
    Update,
    Deletion,
    Hotfix,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangelogRecord {
    pub id: String,
    pub entity_type: RecordType,
    pub entity_id: String,
    pub change_type: ChangeType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub references: Vec<String>,
}

impl RecordPayload for ChangelogRecord {
    const RECORD_TYPE: RecordType = RecordType::Changelog;
    fn id(&self) -> &str {
        &self.id
    }
    fn label(&self) -> &str {
        &self.title
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    Human,
    Agent,
}

impl ActorType {
    pub fn id_prefix(self) -> &'static str {
        match self {
            ActorType::Human => "human:",
            ActorType::Agent => "agent:",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorStatus {
    Active,
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub actor_type: ActorType,
    pub display_name: String,
    pub public_key: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub status: ActorStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
}

impl RecordPayload for ActorRecord {
    const RECORD_TYPE: RecordType = RecordType::Actor;
    fn id(&self) -> &str {
        &self.id
    }
    fn label(&self) -> &str {
        &self.display_name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Archived,
}

/// Automation identity; `id` is the id of the bound agent-type actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default)]
    pub triggers: Vec<String>,
}

impl RecordPayload for AgentRecord {
    const RECORD_TYPE: RecordType = RecordType::Agent;
    fn id(&self) -> &str {
        &self.id
    }
    fn label(&self) -> &str {
        &self.id
    }
}

/// Payload of any record type, for passes that walk the whole store.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyPayload {
    Task(TaskRecord),
    Cycle(CycleRecord),
    Feedback(FeedbackRecord),
    Execution(ExecutionRecord),
    Changelog(ChangelogRecord),
    Actor(ActorRecord),
    Agent(AgentRecord),
}

/// A typed outgoing reference from one record to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    pub field: &'static str,
    pub target_type: RecordType,
    pub target_id: String,
}

impl AnyPayload {
    pub fn from_value(record_type: RecordType, value: JsonValue) -> Result<Self, serde_json::Error> {
        Ok(match record_type {
            RecordType::Task => AnyPayload::Task(serde_json::from_value(value)?),
            RecordType::Cycle => AnyPayload::Cycle(serde_json::from_value(value)?),
            RecordType::Feedback => AnyPayload::Feedback(serde_json::from_value(value)?),
            RecordType::Execution => AnyPayload::Execution(serde_json::from_value(value)?),
            RecordType::Changelog => AnyPayload::Changelog(serde_json::from_value(value)?),
            RecordType::Actor => AnyPayload::Actor(serde_json::from_value(value)?),
            RecordType::Agent => AnyPayload::Agent(serde_json::from_value(value)?),
        })
    }

    /// Canonical wire form, with every defaulted field present.
    pub fn to_value(&self) -> Result<JsonValue, serde_json::Error> {
        match self {
            AnyPayload::Task(p) => serde_json::to_value(p),
            AnyPayload::Cycle(p) => serde_json::to_value(p),
            AnyPayload::Feedback(p) => serde_json::to_value(p),
            AnyPayload::Execution(p) => serde_json::to_value(p),
            AnyPayload::Changelog(p) => serde_json::to_value(p),
            AnyPayload::Actor(p) => serde_json::to_value(p),
            AnyPayload::Agent(p) => serde_json::to_value(p),
        }
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            AnyPayload::Task(_) => RecordType::Task,
            AnyPayload::Cycle(_) => RecordType::Cycle,
            AnyPayload::Feedback(_) => RecordType::Feedback,
            AnyPayload::Execution(_) => RecordType::Execution,
            AnyPayload::Changelog(_) => RecordType::Changelog,
            AnyPayload::Actor(_) => RecordType::Actor,
            AnyPayload::Agent(_) => RecordType::Agent,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            AnyPayload::Task(p) => &p.id,
            AnyPayload::Cycle(p) => &p.id,
            AnyPayload::Feedback(p) => &p.id,
            AnyPayload::Execution(p) => &p.id,
            AnyPayload::Changelog(p) => &p.id,
            AnyPayload::Actor(p) => &p.id,
            AnyPayload::Agent(p) => &p.id,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            AnyPayload::Task(p) => p.label(),
            AnyPayload::Cycle(p) => p.label(),
            AnyPayload::Feedback(p) => p.label(),
            AnyPayload::Execution(p) => p.label(),
            AnyPayload::Changelog(p) => p.label(),
            AnyPayload::Actor(p) => p.label(),
            AnyPayload::Agent(p) => p.label(),
        }
    }

    /// Every id this payload points at, with the field it came from.
    pub fn references(&self) -> Vec<RecordRef> {
        fn refs(field: &'static str, target_type: RecordType, ids: &[String]) -> Vec<RecordRef> {
            ids.iter()
                .map(|id| RecordRef {
                    field,
                    target_type,
                    target_id: id.clone(),
                })
                .collect()
        }
        match self {
            AnyPayload::Task(t) => {
                let mut out = refs("cycleIds", RecordType::Cycle, &t.cycle_ids);
                out.extend(t.dependencies().map(|dep| RecordRef {
                    field: "references",
                    target_type: RecordType::Task,
                    target_id: dep.to_string(),
                }));
                out
            }
            AnyPayload::Cycle(c) => {
                let mut out = refs("taskIds", RecordType::Task, &c.task_ids);
                out.extend(refs("childCycleIds", RecordType::Cycle, &c.child_cycle_ids));
                out
            }
            AnyPayload::Feedback(f) => {
                let mut out = vec![RecordRef {
                    field: "entityId",
                    target_type: f.entity_type,
                    target_id: f.entity_id.clone(),
                }];
                if let Some(assignee) = &f.assignee {
                    out.push(RecordRef {
                        field: "assignee",
                        target_type: RecordType::Actor,
                        target_id: assignee.clone(),
                    });
                }
                if let Some(resolved) = &f.resolves_feedback_id {
                    out.push(RecordRef {
                        field: "resolvesFeedbackId",
                        target_type: RecordType::Feedback,
                        target_id: resolved.clone(),
                    });
                }
                out
            }
            AnyPayload::Execution(e) => vec![RecordRef {
                field: "taskId",
                target_type: RecordType::Task,
                target_id: e.task_id.clone(),
            }],
            AnyPayload::Changelog(c) => vec![RecordRef {
                field: "entityId",
                target_type: c.entity_type,
                target_id: c.entity_id.clone(),
            }],
            AnyPayload::Actor(a) => a
                .superseded_by
                .iter()
                .map(|id| RecordRef {
                    field: "supersededBy",
                    target_type: RecordType::Actor,
                    target_id: id.clone(),
                })
                .collect(),
            AnyPayload::Agent(a) => vec![RecordRef {
                field: "id",
                target_type: RecordType::Actor,
                target_id: a.id.clone(),
            }],
        }
    }
}
