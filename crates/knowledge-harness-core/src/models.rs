//! Core data models used throughout Knowledge Harness.
//!
//! These types represent the tenants, source records, and documents that
//! flow through the indexing and retrieval pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Maximum length of a document title, in characters.
pub const MAX_TITLE_CHARS: usize = 255;

/// Identifier of an isolated tenant (organization).
///
/// Every store, source, and search operation takes a `&TenantId`. The
/// type cannot be empty, so "no tenant" is unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

#[derive(Error, Debug, Clone, PartialEq)]
#[error("tenant id must not be empty")]
pub struct EmptyTenantId;

impl TenantId {
    pub fn new(id: impl Into<String>) -> Result<Self, EmptyTenantId> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(EmptyTenantId);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = EmptyTenantId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = EmptyTenantId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

/// Kind of source record a document was built from.
///
/// The set is closed at build time. Adding a kind means adding a variant
/// here and registering a normalizer for it in
/// [`NormalizerRegistry::with_defaults`](crate::normalize::NormalizerRegistry::with_defaults).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Task,
    Project,
    Message,
    Contact,
    Company,
    Deal,
    Lead,
    Meeting,
    Offer,
    Order,
    Invoice,
    Knowledge,
    Stream,
    InboxItem,
    SomedayMaybe,
    WaitingFor,
    NextAction,
    PreciseGoal,
    AreaOfResponsibility,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("unknown entity type: '{0}'")]
pub struct UnknownEntityType(pub String);

impl EntityType {
    /// All entity types, in the order a full reindex visits them.
    pub const ALL: [EntityType; 19] = [
        EntityType::Stream,
        EntityType::Task,
        EntityType::Message,
        EntityType::Contact,
        EntityType::Company,
        EntityType::Deal,
        EntityType::Project,
        EntityType::Meeting,
        EntityType::Lead,
        EntityType::Offer,
        EntityType::Order,
        EntityType::Invoice,
        EntityType::Knowledge,
        EntityType::InboxItem,
        EntityType::PreciseGoal,
        EntityType::AreaOfResponsibility,
        EntityType::SomedayMaybe,
        EntityType::WaitingFor,
        EntityType::NextAction,
    ];

    /// Canonical tag, e.g. `"INBOX_ITEM"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Task => "TASK",
            EntityType::Project => "PROJECT",
            EntityType::Message => "MESSAGE",
            EntityType::Contact => "CONTACT",
            EntityType::Company => "COMPANY",
            EntityType::Deal => "DEAL",
            EntityType::Lead => "LEAD",
            EntityType::Meeting => "MEETING",
            EntityType::Offer => "OFFER",
            EntityType::Order => "ORDER",
            EntityType::Invoice => "INVOICE",
            EntityType::Knowledge => "KNOWLEDGE",
            EntityType::Stream => "STREAM",
            EntityType::InboxItem => "INBOX_ITEM",
            EntityType::SomedayMaybe => "SOMEDAY_MAYBE",
            EntityType::WaitingFor => "WAITING_FOR",
            EntityType::NextAction => "NEXT_ACTION",
            EntityType::PreciseGoal => "PRECISE_GOAL",
            EntityType::AreaOfResponsibility => "AREA_OF_RESPONSIBILITY",
        }
    }

    /// Lowercase form used for file names and URL segments, e.g. `"inbox_item"`.
    pub fn slug(&self) -> String {
        self.as_str().to_ascii_lowercase()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = UnknownEntityType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('-', "_").to_ascii_uppercase();
        EntityType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| UnknownEntityType(s.to_string()))
    }
}

/// A record handed over by a source collaborator, with its relations
/// already joined.
///
/// `fields` holds the record's own columns; `related` holds denormalized
/// sub-objects such as `project`, `assignee`, or `company`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub entity_type: EntityType,
    pub entity_id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub related: Map<String, Value>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SourceRecord {
    /// Build a record from a JSON object of fields. Non-object values
    /// produce a record with no fields.
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>, fields: Value) -> Self {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            entity_type,
            entity_id: entity_id.into(),
            fields,
            related: Map::new(),
            updated_at: None,
        }
    }

    pub fn with_related(mut self, key: impl Into<String>, value: Value) -> Self {
        self.related.insert(key.into(), value);
        self
    }

    pub fn with_updated_at(mut self, ts: DateTime<Utc>) -> Self {
        self.updated_at = Some(ts);
        self
    }

    /// Resolve a field path.
    ///
    /// A bare name (`"description"`) is looked up in `fields`. A dotted
    /// path (`"project.name"`) resolves its first segment in `related`,
    /// falling back to `fields`, then walks the remaining segments.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let head = segments.next()?;
        let rest: Vec<&str> = segments.collect();

        let root = if rest.is_empty() {
            self.fields.get(head)
        } else {
            self.related.get(head).or_else(|| self.fields.get(head))
        };

        rest.iter()
            .try_fold(root?, |value, segment| value.as_object()?.get(*segment))
            .filter(|v| !v.is_null())
    }

    /// Resolve a field path to a non-blank display string.
    pub fn text(&self, path: &str) -> Option<String> {
        let value = self.lookup(path)?;
        let text = match value {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Array(items) => items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(", "),
            Value::Object(_) | Value::Null => return None,
        };
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// Metadata carried by every document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Indexing origin tag, e.g. `"task-index"`.
    pub source: String,
    /// Rank hint in `1..=5`; secondary sort key in search.
    pub importance: u8,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Entity-specific extras (stage, value, due date, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for DocumentMetadata {
    fn default() -> Self {
        Self {
            source: "manual".to_string(),
            importance: 1,
            language: "en".to_string(),
            status: None,
            priority: None,
            tags: Vec::new(),
            extra: Map::new(),
        }
    }
}

/// Output of a normalizer: everything a document needs except the vector.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedContent {
    pub title: String,
    pub content: String,
    pub metadata: DocumentMetadata,
}

/// The unit of storage: one source record's embedded, hashed content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub tenant_id: TenantId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub title: String,
    pub content: String,
    pub content_hash: String,
    pub embedding: Vec<f32>,
    pub metadata: DocumentMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Assemble a new document with a fresh id and a computed content hash.
    pub fn new(
        tenant_id: TenantId,
        record: &SourceRecord,
        normalized: NormalizedContent,
        embedding: Vec<f32>,
    ) -> Self {
        let now = Utc::now();
        let content_hash = crate::hash::content_hash(&normalized.content);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id,
            entity_type: record.entity_type,
            entity_id: record.entity_id.clone(),
            title: normalized.title,
            content: normalized.content,
            content_hash,
            embedding,
            metadata: normalized.metadata,
            created_at: now,
            updated_at: record.updated_at.unwrap_or(now),
        }
    }
}
