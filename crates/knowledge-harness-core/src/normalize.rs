//! Content normalization: one source record in, one canonical text blob out.
//!
//! Each entity type has a [`Normalizer`] strategy registered in a
//! [`NormalizerRegistry`]. The built-in strategies are [`FieldNormalizer`]s
//! driven by a static [`EntitySpec`] table, so supporting a new kind of
//! record means adding one table entry rather than a new code path.
//!
//! # Content Layout
//!
//! ```text
//! {Label}: {title}. {Field label}: {value}. {free text}. ...
//! ```
//!
//! Absent or blank fields contribute nothing. Long free-text fields are
//! capped per field, and the whole blob is capped by
//! [`NormalizeOptions::max_content_chars`].

use std::collections::HashMap;

use chrono::NaiveDate;
use serde_json::Value;

use crate::error::NormalizeError;
use crate::models::{
    DocumentMetadata, EntityType, NormalizedContent, SourceRecord, MAX_TITLE_CHARS,
};

/// Separator between content segments.
pub const SEGMENT_SEPARATOR: &str = ". ";

/// Global limits applied after a strategy has built its content.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizeOptions {
    pub max_content_chars: usize,
    pub min_content_chars: usize,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            max_content_chars: 10_000,
            min_content_chars: 10,
        }
    }
}

/// A normalization strategy for one entity type.
pub trait Normalizer: Send + Sync {
    fn entity_type(&self) -> EntityType;
    fn normalize(&self, record: &SourceRecord) -> Result<NormalizedContent, NormalizeError>;
}

/// How a record's title is derived.
#[derive(Debug, Clone, Copy)]
pub enum TitleRule {
    /// First non-blank path wins. None present is a `MissingField` error.
    First(&'static [&'static str]),
    /// Non-blank paths joined with a space (e.g. first + last name).
    Joined(&'static [&'static str]),
    /// Excerpt of the first non-blank path, capped to the given length;
    /// falls back to `"{label} {entity_id}"`.
    Excerpt(&'static [&'static str], usize),
}

/// How `metadata.importance` is derived.
#[derive(Debug, Clone, Copy)]
pub enum ImportanceRule {
    Fixed(u8),
    /// Rank the priority field; unknown or absent values use `default`.
    Priority { path: &'static str, default: u8 },
}

/// One labeled content field.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    /// `None` for free text that is emitted without a label.
    pub label: Option<&'static str>,
    /// Candidate paths; the first non-blank one is used.
    pub paths: &'static [&'static str],
    pub max_chars: Option<usize>,
    /// Reduce ISO timestamps to their `YYYY-MM-DD` part.
    pub date: bool,
}

impl FieldSpec {
    pub const fn labeled(label: &'static str, paths: &'static [&'static str]) -> Self {
        Self {
            label: Some(label),
            paths,
            max_chars: None,
            date: false,
        }
    }

    pub const fn free_text(paths: &'static [&'static str], max_chars: usize) -> Self {
        Self {
            label: None,
            paths,
            max_chars: Some(max_chars),
            date: false,
        }
    }

    pub const fn capped(mut self, max_chars: usize) -> Self {
        self.max_chars = Some(max_chars);
        self
    }

    pub const fn date(mut self) -> Self {
        self.date = true;
        self
    }
}

/// Declarative description of how one entity type becomes text.
#[derive(Debug, Clone, Copy)]
pub struct EntitySpec {
    pub entity_type: EntityType,
    pub label: &'static str,
    pub title: TitleRule,
    pub fields: &'static [FieldSpec],
    pub importance: ImportanceRule,
    /// Value of `metadata.source`.
    pub source: &'static str,
    pub status_field: Option<&'static str>,
    pub priority_field: Option<&'static str>,
    pub tags_field: Option<&'static str>,
    /// Raw values copied into `metadata.extra`, keyed by path with `.` → `_`.
    pub extra_fields: &'static [&'static str],
}

const NOTES_CAP: usize = 500;
const BODY_CAP: usize = 2000;
const DERIVED_TITLE_CAP: usize = 100;

/// Built-in specs, one per [`EntityType`].
pub static DEFAULT_SPECS: &[EntitySpec] = &[
    EntitySpec {
        entity_type: EntityType::Task,
        label: "Task",
        title: TitleRule::First(&["title", "name"]),
        fields: &[
            FieldSpec::free_text(&["description"], NOTES_CAP),
            FieldSpec::labeled("Status", &["status"]),
            FieldSpec::labeled("Project", &["project.name"]),
            FieldSpec::labeled("Stream", &["stream.name"]),
            FieldSpec::labeled("Assignee", &["assignee.name"]),
            FieldSpec::labeled("Due", &["due_date"]).date(),
        ],
        importance: ImportanceRule::Priority {
            path: "priority",
            default: 3,
        },
        source: "task-index",
        status_field: Some("status"),
        priority_field: Some("priority"),
        tags_field: Some("tags"),
        extra_fields: &["due_date", "project.name"],
    },
    EntitySpec {
        entity_type: EntityType::Project,
        label: "Project",
        title: TitleRule::First(&["name", "title"]),
        fields: &[
            FieldSpec::free_text(&["description"], NOTES_CAP),
            FieldSpec::labeled("Status", &["status"]),
            FieldSpec::labeled("Owner", &["owner.name"]),
            FieldSpec::labeled("Start", &["start_date"]).date(),
            FieldSpec::labeled("End", &["end_date"]).date(),
        ],
        importance: ImportanceRule::Priority {
            path: "priority",
            default: 3,
        },
        source: "project-index",
        status_field: Some("status"),
        priority_field: Some("priority"),
        tags_field: Some("tags"),
        extra_fields: &["end_date"],
    },
    EntitySpec {
        entity_type: EntityType::Message,
        label: "Email",
        title: TitleRule::Excerpt(&["subject"], MAX_TITLE_CHARS),
        fields: &[
            FieldSpec::labeled("From", &["from_name", "from_address"]),
            FieldSpec::labeled("To", &["to_address"]),
            FieldSpec::labeled("Date", &["received_at", "sent_at"]).date(),
            FieldSpec::free_text(&["content", "body"], BODY_CAP),
            FieldSpec::free_text(&["extracted_context"], NOTES_CAP),
        ],
        importance: ImportanceRule::Priority {
            path: "priority",
            default: 2,
        },
        source: "email-index",
        status_field: None,
        priority_field: Some("priority"),
        tags_field: None,
        extra_fields: &["message_type", "from_address"],
    },
    EntitySpec {
        entity_type: EntityType::Contact,
        label: "Contact",
        title: TitleRule::Joined(&["first_name", "last_name"]),
        fields: &[
            FieldSpec::labeled("Email", &["email"]),
            FieldSpec::labeled("Phone", &["phone"]),
            FieldSpec::labeled("Position", &["position"]),
            FieldSpec::labeled("Company", &["company.name"]),
            FieldSpec::labeled("Notes", &["notes"]).capped(NOTES_CAP),
        ],
        importance: ImportanceRule::Fixed(3),
        source: "contact-index",
        status_field: Some("status"),
        priority_field: None,
        tags_field: Some("tags"),
        extra_fields: &["email"],
    },
    EntitySpec {
        entity_type: EntityType::Company,
        label: "Company",
        title: TitleRule::First(&["name"]),
        fields: &[
            FieldSpec::labeled("Industry", &["industry"]),
            FieldSpec::labeled("Website", &["website"]),
            FieldSpec::labeled("Phone", &["phone"]),
            FieldSpec::labeled("Address", &["address"]),
            FieldSpec::labeled("Description", &["description"]).capped(NOTES_CAP),
        ],
        importance: ImportanceRule::Fixed(3),
        source: "company-index",
        status_field: Some("status"),
        priority_field: None,
        tags_field: Some("tags"),
        extra_fields: &["industry"],
    },
    EntitySpec {
        entity_type: EntityType::Deal,
        label: "Deal",
        title: TitleRule::First(&["title", "name"]),
        fields: &[
            FieldSpec::labeled("Company", &["company.name"]),
            FieldSpec::labeled("Value", &["value"]),
            FieldSpec::labeled("Stage", &["stage"]),
            FieldSpec::labeled("Description", &["description"]).capped(NOTES_CAP),
        ],
        importance: ImportanceRule::Priority {
            path: "priority",
            default: 3,
        },
        source: "deal-index",
        status_field: Some("status"),
        priority_field: Some("priority"),
        tags_field: None,
        extra_fields: &["stage", "value"],
    },
    EntitySpec {
        entity_type: EntityType::Lead,
        label: "Lead",
        title: TitleRule::First(&["title", "name"]),
        fields: &[
            FieldSpec::labeled("Contact person", &["contact_person"]),
            FieldSpec::labeled("Company", &["company.name", "company"]),
            FieldSpec::labeled("Origin", &["source"]),
            FieldSpec::labeled("Status", &["status"]),
            FieldSpec::labeled("Description", &["description"]).capped(NOTES_CAP),
        ],
        importance: ImportanceRule::Priority {
            path: "priority",
            default: 3,
        },
        source: "lead-index",
        status_field: Some("status"),
        priority_field: Some("priority"),
        tags_field: None,
        extra_fields: &["source"],
    },
    EntitySpec {
        entity_type: EntityType::Meeting,
        label: "Meeting",
        title: TitleRule::First(&["title"]),
        fields: &[
            FieldSpec::free_text(&["description"], NOTES_CAP),
            FieldSpec::labeled("Location", &["location"]),
            FieldSpec::labeled("Date", &["start_time"]).date(),
            FieldSpec::labeled("Status", &["status"]),
            FieldSpec::labeled("Notes", &["notes"]).capped(NOTES_CAP),
        ],
        importance: ImportanceRule::Fixed(3),
        source: "meeting-index",
        status_field: Some("status"),
        priority_field: None,
        tags_field: None,
        extra_fields: &["start_time"],
    },
    EntitySpec {
        entity_type: EntityType::Offer,
        label: "Offer",
        title: TitleRule::Excerpt(&["offer_number", "title"], MAX_TITLE_CHARS),
        fields: &[
            FieldSpec::labeled("Company", &["company.name"]),
            FieldSpec::labeled("Contact", &["contact.name"]),
            FieldSpec::labeled("Value", &["total_amount"]),
            FieldSpec::labeled("Status", &["status"]),
            FieldSpec::labeled("Valid until", &["valid_until"]).date(),
            FieldSpec::labeled("Notes", &["notes"]).capped(NOTES_CAP),
        ],
        importance: ImportanceRule::Fixed(3),
        source: "offer-index",
        status_field: Some("status"),
        priority_field: None,
        tags_field: None,
        extra_fields: &["total_amount"],
    },
    EntitySpec {
        entity_type: EntityType::Order,
        label: "Order",
        title: TitleRule::Excerpt(&["order_number", "title"], MAX_TITLE_CHARS),
        fields: &[
            FieldSpec::labeled("Customer", &["customer.name", "customer"]),
            FieldSpec::labeled("Value", &["total_amount"]),
            FieldSpec::labeled("Status", &["status"]),
            FieldSpec::labeled("Delivery", &["delivery_date"]).date(),
            FieldSpec::labeled("Description", &["description"]).capped(NOTES_CAP),
        ],
        importance: ImportanceRule::Fixed(3),
        source: "order-index",
        status_field: Some("status"),
        priority_field: None,
        tags_field: None,
        extra_fields: &["total_amount"],
    },
    EntitySpec {
        entity_type: EntityType::Invoice,
        label: "Invoice",
        title: TitleRule::Excerpt(&["invoice_number", "title"], MAX_TITLE_CHARS),
        fields: &[
            FieldSpec::labeled("Amount", &["amount"]),
            FieldSpec::labeled("Total", &["total_amount"]),
            FieldSpec::labeled("Status", &["status"]),
            FieldSpec::labeled("Issued", &["issued_at", "created_at"]).date(),
            FieldSpec::labeled("Due", &["due_date"]).date(),
            FieldSpec::labeled("Description", &["description"]).capped(NOTES_CAP),
        ],
        importance: ImportanceRule::Fixed(3),
        source: "invoice-index",
        status_field: Some("status"),
        priority_field: None,
        tags_field: None,
        extra_fields: &["total_amount", "due_date"],
    },
    EntitySpec {
        entity_type: EntityType::Knowledge,
        label: "Article",
        title: TitleRule::First(&["title"]),
        fields: &[
            FieldSpec::labeled("Category", &["category"]),
            FieldSpec::free_text(&["summary"], NOTES_CAP),
            FieldSpec::free_text(&["content", "body"], BODY_CAP),
            FieldSpec::labeled("Tags", &["tags"]),
        ],
        importance: ImportanceRule::Fixed(4),
        source: "knowledge-index",
        status_field: Some("status"),
        priority_field: None,
        tags_field: Some("tags"),
        extra_fields: &["category"],
    },
    EntitySpec {
        entity_type: EntityType::Stream,
        label: "Stream",
        title: TitleRule::First(&["name"]),
        fields: &[
            FieldSpec::free_text(&["description"], NOTES_CAP),
            FieldSpec::labeled("Type", &["stream_type"]),
            FieldSpec::labeled("GTD role", &["stream_role"]),
            FieldSpec::labeled("Status", &["status"]),
        ],
        importance: ImportanceRule::Fixed(3),
        source: "stream-index",
        status_field: Some("status"),
        priority_field: None,
        tags_field: None,
        extra_fields: &["stream_type"],
    },
    EntitySpec {
        entity_type: EntityType::InboxItem,
        label: "Inbox",
        title: TitleRule::Excerpt(&["content"], DERIVED_TITLE_CAP),
        fields: &[
            FieldSpec::free_text(&["content"], BODY_CAP),
            FieldSpec::labeled("Source", &["source_type"]),
            FieldSpec::labeled("Status", &["status"]),
        ],
        importance: ImportanceRule::Fixed(2),
        source: "gtd-index",
        status_field: Some("status"),
        priority_field: None,
        tags_field: None,
        extra_fields: &["source_type"],
    },
    EntitySpec {
        entity_type: EntityType::SomedayMaybe,
        label: "Someday/Maybe",
        title: TitleRule::First(&["title"]),
        fields: &[
            FieldSpec::free_text(&["description"], NOTES_CAP),
            FieldSpec::labeled("Category", &["category"]),
        ],
        importance: ImportanceRule::Fixed(1),
        source: "gtd-index",
        status_field: None,
        priority_field: None,
        tags_field: None,
        extra_fields: &["category"],
    },
    EntitySpec {
        entity_type: EntityType::WaitingFor,
        label: "Waiting for",
        title: TitleRule::Excerpt(&["description"], DERIVED_TITLE_CAP),
        fields: &[
            FieldSpec::free_text(&["description"], NOTES_CAP),
            FieldSpec::labeled("From", &["waiting_for_who"]),
            FieldSpec::labeled("Expected", &["expected_response_date"]).date(),
        ],
        importance: ImportanceRule::Fixed(3),
        source: "gtd-index",
        status_field: Some("status"),
        priority_field: None,
        tags_field: None,
        extra_fields: &["expected_response_date"],
    },
    EntitySpec {
        entity_type: EntityType::NextAction,
        label: "Next action",
        title: TitleRule::First(&["title"]),
        fields: &[
            FieldSpec::free_text(&["description"], NOTES_CAP),
            FieldSpec::labeled("Context", &["context"]),
            FieldSpec::labeled("Energy", &["energy"]),
            FieldSpec::labeled("Time", &["estimated_time"]),
        ],
        importance: ImportanceRule::Priority {
            path: "priority",
            default: 3,
        },
        source: "gtd-index",
        status_field: None,
        priority_field: Some("priority"),
        tags_field: None,
        extra_fields: &["context"],
    },
    EntitySpec {
        entity_type: EntityType::PreciseGoal,
        label: "Goal",
        title: TitleRule::First(&["result", "title"]),
        fields: &[
            FieldSpec::free_text(&["background"], NOTES_CAP),
            FieldSpec::labeled("Measure", &["measurement"]),
            FieldSpec::labeled("Deadline", &["deadline"]).date(),
            FieldSpec::labeled("Status", &["status"]),
        ],
        importance: ImportanceRule::Fixed(4),
        source: "gtd-index",
        status_field: Some("status"),
        priority_field: None,
        tags_field: None,
        extra_fields: &["deadline"],
    },
    EntitySpec {
        entity_type: EntityType::AreaOfResponsibility,
        label: "Area of responsibility",
        title: TitleRule::First(&["name"]),
        fields: &[
            FieldSpec::free_text(&["description"], NOTES_CAP),
            FieldSpec::labeled("Purpose", &["purpose"]),
        ],
        importance: ImportanceRule::Fixed(3),
        source: "gtd-index",
        status_field: None,
        priority_field: None,
        tags_field: None,
        extra_fields: &[],
    },
];

/// Map a priority label to an importance rank.
pub fn priority_rank(priority: &str) -> Option<u8> {
    match priority.trim().to_ascii_uppercase().as_str() {
        "CRITICAL" | "URGENT" => Some(5),
        "HIGH" => Some(4),
        "MEDIUM" | "NORMAL" => Some(3),
        "LOW" => Some(2),
        _ => None,
    }
}

/// Cut `text` to at most `max` characters, on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn format_date(raw: &str) -> String {
    match raw.get(..10) {
        Some(day) if NaiveDate::parse_from_str(day, "%Y-%m-%d").is_ok() => day.to_string(),
        _ => raw.to_string(),
    }
}

fn first_text(record: &SourceRecord, paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|p| record.text(p))
}

/// Table-driven normalizer for one entity type.
#[derive(Debug, Clone)]
pub struct FieldNormalizer {
    spec: EntitySpec,
}

impl FieldNormalizer {
    pub fn new(spec: EntitySpec) -> Self {
        Self { spec }
    }

    fn title(&self, record: &SourceRecord) -> Result<String, NormalizeError> {
        let missing = |field: &str| NormalizeError::MissingField {
            entity_type: record.entity_type,
            entity_id: record.entity_id.clone(),
            field: field.to_string(),
        };

        match self.spec.title {
            TitleRule::First(paths) => {
                first_text(record, paths).ok_or_else(|| missing(paths.first().unwrap_or(&"title")))
            }
            TitleRule::Joined(paths) => {
                let parts: Vec<String> = paths.iter().filter_map(|p| record.text(p)).collect();
                if parts.is_empty() {
                    Err(missing(&paths.join("+")))
                } else {
                    Ok(parts.join(" "))
                }
            }
            TitleRule::Excerpt(paths, cap) => Ok(match first_text(record, paths) {
                Some(text) => truncate_chars(&text, cap),
                None => format!("{} {}", self.spec.label, record.entity_id),
            }),
        }
    }

    fn importance(&self, record: &SourceRecord) -> u8 {
        match self.spec.importance {
            ImportanceRule::Fixed(n) => n,
            ImportanceRule::Priority { path, default } => record
                .text(path)
                .and_then(|p| priority_rank(&p))
                .unwrap_or(default),
        }
    }

    fn metadata(&self, record: &SourceRecord) -> DocumentMetadata {
        let tags = self
            .spec
            .tags_field
            .and_then(|path| record.lookup(path))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let mut extra = serde_json::Map::new();
        for path in self.spec.extra_fields {
            if let Some(value) = record.lookup(path) {
                extra.insert(path.replace('.', "_"), value.clone());
            }
        }

        DocumentMetadata {
            source: self.spec.source.to_string(),
            importance: self.importance(record),
            language: record.text("language").unwrap_or_else(|| "en".to_string()),
            status: self.spec.status_field.and_then(|p| record.text(p)),
            priority: self
                .spec
                .priority_field
                .and_then(|p| record.text(p))
                .map(|p| p.to_ascii_uppercase()),
            tags,
            extra,
        }
    }
}

impl Normalizer for FieldNormalizer {
    fn entity_type(&self) -> EntityType {
        self.spec.entity_type
    }

    fn normalize(&self, record: &SourceRecord) -> Result<NormalizedContent, NormalizeError> {
        let title = self.title(record)?;

        let mut segments = vec![format!("{}: {}", self.spec.label, title)];
        for field in self.spec.fields {
            let Some(mut value) = first_text(record, field.paths) else {
                continue;
            };
            if field.date {
                value = format_date(&value);
            }
            if let Some(cap) = field.max_chars {
                value = truncate_chars(&value, cap);
            }
            let value = value.trim().trim_end_matches('.').trim_end();
            if value.is_empty() {
                continue;
            }
            segments.push(match field.label {
                Some(label) => format!("{}: {}", label, value),
                None => value.to_string(),
            });
        }

        Ok(NormalizedContent {
            title,
            content: segments.join(SEGMENT_SEPARATOR),
            metadata: self.metadata(record),
        })
    }
}

/// Lookup table from entity type to normalizer strategy.
pub struct NormalizerRegistry {
    strategies: HashMap<EntityType, Box<dyn Normalizer>>,
    options: NormalizeOptions,
}

impl NormalizerRegistry {
    /// An empty registry.
    pub fn new(options: NormalizeOptions) -> Self {
        Self {
            strategies: HashMap::new(),
            options,
        }
    }

    /// A registry with a [`FieldNormalizer`] for every [`DEFAULT_SPECS`] entry.
    pub fn with_defaults(options: NormalizeOptions) -> Self {
        let mut registry = Self::new(options);
        for spec in DEFAULT_SPECS {
            registry.register(Box::new(FieldNormalizer::new(*spec)));
        }
        registry
    }

    /// Register a strategy, replacing any previous one for the same type.
    pub fn register(&mut self, normalizer: Box<dyn Normalizer>) {
        self.strategies.insert(normalizer.entity_type(), normalizer);
    }

    pub fn supports(&self, entity_type: EntityType) -> bool {
        self.strategies.contains_key(&entity_type)
    }

    pub fn options(&self) -> NormalizeOptions {
        self.options
    }

    /// Normalize a record and enforce the global length limits.
    pub fn normalize(&self, record: &SourceRecord) -> Result<NormalizedContent, NormalizeError> {
        let strategy = self
            .strategies
            .get(&record.entity_type)
            .ok_or(NormalizeError::UnsupportedType(record.entity_type))?;

        let mut normalized = strategy.normalize(record)?;
        normalized.title = truncate_chars(normalized.title.trim(), MAX_TITLE_CHARS);
        normalized.content = truncate_chars(&normalized.content, self.options.max_content_chars);

        let len = normalized.content.trim().chars().count();
        if len < self.options.min_content_chars {
            return Err(NormalizeError::ContentTooShort {
                entity_type: record.entity_type,
                entity_id: record.entity_id.clone(),
                len,
                min: self.options.min_content_chars,
            });
        }

        Ok(normalized)
    }
}

impl Default for NormalizerRegistry {
    fn default() -> Self {
        Self::with_defaults(NormalizeOptions::default())
    }
}
