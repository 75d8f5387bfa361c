use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type Metadata = BTreeMap<String, Value>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContractError {
    #[error("{field} must not be blank")]
    EmptyField { field: &'static str },
    #[error("{entity} patch must set at least one field")]
    EmptyPatch { entity: &'static str },
    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("dependency graph has a cycle through: {}", .nodes.join(", "))]
    DependencyCycle { nodes: Vec<String> },
}

/// Schema check run on every insert payload and patch before anything is persisted.
pub trait Validate {
    fn validate(&self) -> Result<(), ContractError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemRole {
    User,
    Assistant,
    System,
    Tool,
}

impl ItemRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemRole::User => "user",
            ItemRole::Assistant => "assistant",
            ItemRole::System => "system",
            ItemRole::Tool => "tool",
        }
    }
}

impl fmt::Display for ItemRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemRole {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "user" => Ok(ItemRole::User),
            "assistant" => Ok(ItemRole::Assistant),
            "system" => Ok(ItemRole::System),
            "tool" => Ok(ItemRole::Tool),
            other => Err(format!("Unknown item role: {other}")),
        }
    }
}

/// Per-item display and context-inclusion state.
///
/// `Hidden` items stay in the agent context but are not rendered; `Archived` items are
/// soft-deleted and excluded from both.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
    Archived,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Visible => "visible",
            Visibility::Hidden => "hidden",
            Visibility::Archived => "archived",
        }
    }

    pub fn shown_in_ui(&self) -> bool {
        matches!(self, Visibility::Visible)
    }

    pub fn in_agent_context(&self) -> bool {
        !matches!(self, Visibility::Archived)
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Visibility {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "visible" => Ok(Visibility::Visible),
            "hidden" => Ok(Visibility::Hidden),
            "archived" => Ok(Visibility::Archived),
            other => Err(format!("Unknown visibility: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    #[default]
    DependsOn,
    CausedBy,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::DependsOn => "depends_on",
            EdgeType::CausedBy => "caused_by",
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeType {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "depends_on" | "depends-on" => Ok(EdgeType::DependsOn),
            "caused_by" | "caused-by" => Ok(EdgeType::CausedBy),
            other => Err(format!("Unknown edge type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    #[default]
    Active,
    Completed,
    Aborted,
    Expired,
}

impl StreamStatus {
    pub const ALL: [StreamStatus; 4] = [
        StreamStatus::Active,
        StreamStatus::Completed,
        StreamStatus::Aborted,
        StreamStatus::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Active => "active",
            StreamStatus::Completed => "completed",
            StreamStatus::Aborted => "aborted",
            StreamStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamStatus::Active)
    }

    /// Terminal states never change; re-applying the same status is allowed.
    pub fn can_transition_to(&self, target: StreamStatus) -> bool {
        *self == target || *self == StreamStatus::Active
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "active" => Ok(StreamStatus::Active),
            "completed" => Ok(StreamStatus::Completed),
            "aborted" => Ok(StreamStatus::Aborted),
            "expired" => Ok(StreamStatus::Expired),
            other => Err(format!("Unknown stream status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("Unknown sort order: {other}")),
        }
    }
}

// Threads

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thread {
    pub id: String,
    pub project_id: String,
    pub scope_type: Option<String>,
    pub scope_id: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewThread {
    pub project_id: String,
    #[serde(default)]
    pub scope_type: Option<String>,
    #[serde(default)]
    pub scope_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewThread {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Self::default()
        }
    }

    pub fn with_scope(
        mut self,
        scope_type: impl Into<String>,
        scope_id: impl Into<String>,
    ) -> Self {
        self.scope_type = Some(scope_type.into());
        self.scope_id = Some(scope_id.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

impl Validate for NewThread {
    fn validate(&self) -> Result<(), ContractError> {
        require_non_blank("project_id", &self.project_id)?;
        optional_non_blank("scope_type", self.scope_type.as_deref())?;
        optional_non_blank("scope_id", self.scope_id.as_deref())?;
        optional_non_blank("title", self.title.as_deref())?;
        validate_metadata(&self.metadata)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ThreadPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl Validate for ThreadPatch {
    fn validate(&self) -> Result<(), ContractError> {
        if self.title.is_none() && self.metadata.is_none() {
            return Err(ContractError::EmptyPatch { entity: "thread" });
        }
        optional_non_blank("title", self.title.as_deref())?;
        if let Some(metadata) = self.metadata.as_ref() {
            validate_metadata(metadata)?;
        }
        Ok(())
    }
}

// Items

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub id: String,
    pub thread_id: String,
    pub role: ItemRole,
    pub parts: Vec<Value>,
    pub run_id: Option<String>,
    pub span_id: Option<String>,
    pub parent_id: Option<String>,
    pub visibility: Visibility,
    pub attempt: u32,
    pub request_id: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewItem {
    pub thread_id: String,
    pub role: ItemRole,
    #[serde(default)]
    pub parts: Vec<Value>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub span_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub attempt: u32,
    pub request_id: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewItem {
    pub fn new(
        thread_id: impl Into<String>,
        role: ItemRole,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            role,
            parts: Vec::new(),
            run_id: None,
            span_id: None,
            parent_id: None,
            visibility: Visibility::Visible,
            attempt: 0,
            request_id: request_id.into(),
            metadata: Metadata::new(),
        }
    }

    /// Appends a `{ "type": "text", "text": ... }` part.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.parts.push(json!({ "type": "text", "text": text.into() }));
        self
    }

    pub fn in_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn in_span(mut self, span_id: impl Into<String>) -> Self {
        self.span_id = Some(span_id.into());
        self
    }

    pub fn reply_to(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

impl Validate for NewItem {
    fn validate(&self) -> Result<(), ContractError> {
        require_non_blank("thread_id", &self.thread_id)?;
        require_non_blank("request_id", &self.request_id)?;
        optional_non_blank("run_id", self.run_id.as_deref())?;
        optional_non_blank("span_id", self.span_id.as_deref())?;
        optional_non_blank("parent_id", self.parent_id.as_deref())?;
        validate_metadata(&self.metadata)
    }
}

/// Visibility is the only item field that may change after creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemPatch {
    pub visibility: Visibility,
}

impl Validate for ItemPatch {
    fn validate(&self) -> Result<(), ContractError> {
        Ok(())
    }
}

// Edges

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Edge {
    pub id: String,
    pub thread_id: String,
    pub from_item_id: String,
    pub to_item_id: String,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    pub request_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewEdge {
    pub thread_id: String,
    pub from_item_id: String,
    pub to_item_id: String,
    #[serde(default, rename = "type")]
    pub edge_type: EdgeType,
    pub request_id: String,
}

impl Validate for NewEdge {
    fn validate(&self) -> Result<(), ContractError> {
        require_non_blank("thread_id", &self.thread_id)?;
        require_non_blank("from_item_id", &self.from_item_id)?;
        require_non_blank("to_item_id", &self.to_item_id)?;
        require_non_blank("request_id", &self.request_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DagEdge {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
}

/// Read-side projection of a thread's dependency graph. `nodes` holds only items that sit on
/// at least one edge.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DagStructure {
    pub nodes: Vec<String>,
    pub edges: Vec<DagEdge>,
}

// Streams

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamSnapshot {
    #[serde(default)]
    pub parts: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stream {
    pub id: String,
    pub thread_id: String,
    pub run_id: Option<String>,
    pub status: StreamStatus,
    pub resume_token: Option<String>,
    pub last_event_id: Option<String>,
    pub snapshot: StreamSnapshot,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Stream {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    pub fn is_resumable_at(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal()
            && self.resume_token.is_some()
            && !self.is_expired_at(now)
    }
}

/// Insert payload for a stream. Streams always begin `active` with an empty snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewStream {
    pub thread_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Validate for NewStream {
    fn validate(&self) -> Result<(), ContractError> {
        require_non_blank("thread_id", &self.thread_id)?;
        optional_non_blank("run_id", self.run_id.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamPatch {
    #[serde(default)]
    pub status: Option<StreamStatus>,
    #[serde(default)]
    pub resume_token: Option<String>,
    #[serde(default)]
    pub last_event_id: Option<String>,
    #[serde(default)]
    pub snapshot: Option<StreamSnapshot>,
}

impl Validate for StreamPatch {
    fn validate(&self) -> Result<(), ContractError> {
        if self.status.is_none()
            && self.resume_token.is_none()
            && self.last_event_id.is_none()
            && self.snapshot.is_none()
        {
            return Err(ContractError::EmptyPatch { entity: "stream" });
        }
        optional_non_blank("resume_token", self.resume_token.as_deref())?;
        optional_non_blank("last_event_id", self.last_event_id.as_deref())?;
        if let Some(metadata) = self.snapshot.as_ref().and_then(|s| s.metadata.as_ref()) {
            validate_metadata(metadata)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadWithItems {
    #[serde(flatten)]
    pub thread: Thread,
    pub items: Vec<Item>,
}

fn require_non_blank(field: &'static str, value: &str) -> Result<(), ContractError> {
    if value.trim().is_empty() {
        return Err(ContractError::EmptyField { field });
    }
    Ok(())
}

fn optional_non_blank(field: &'static str, value: Option<&str>) -> Result<(), ContractError> {
    match value {
        Some(value) => require_non_blank(field, value),
        None => Ok(()),
    }
}

fn validate_metadata(metadata: &Metadata) -> Result<(), ContractError> {
    if metadata.keys().any(|key| key.trim().is_empty()) {
        return Err(ContractError::InvalidValue {
            field: "metadata",
            reason: "keys must not be blank".to_string(),
        });
    }
    Ok(())
}
