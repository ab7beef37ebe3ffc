//! JSON export files as record sources.
//!
//! Layout: `<root>/<tenant>/<entity_type>.json`, e.g.
//! `data/exports/acme/task.json`. Each file holds a JSON array of flat
//! objects:
//!
//! ```json
//! [
//!   { "id": "t-1", "title": "Call client ABC", "priority": "HIGH",
//!     "updated_at": "2024-05-01T10:00:00Z",
//!     "related": { "project": { "name": "Renewals" } } }
//! ]
//! ```
//!
//! `id` is required. `related` and `updated_at` are lifted out; every
//! other key becomes a record field. A missing file means the tenant has
//! no such collection and is reported as unavailable.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::debug;

use knowledge_harness_core::error::SourceError;
use knowledge_harness_core::models::{EntityType, SourceRecord, TenantId};
use knowledge_harness_core::source::{RecordSource, SourceRegistry};

pub struct JsonFileSource {
    root: PathBuf,
    entity_type: EntityType,
}

impl JsonFileSource {
    pub fn new(root: impl Into<PathBuf>, entity_type: EntityType) -> Self {
        Self {
            root: root.into(),
            entity_type,
        }
    }

    pub fn path_for(&self, tenant: &TenantId) -> PathBuf {
        self.root
            .join(tenant.as_str())
            .join(format!("{}.json", self.entity_type.slug()))
    }
}

/// A registry with one [`JsonFileSource`] per entity type under `root`.
pub fn json_sources(root: &Path) -> SourceRegistry {
    let mut registry = SourceRegistry::new();
    for entity_type in EntityType::ALL {
        registry.register(Box::new(JsonFileSource::new(root, entity_type)));
    }
    registry
}

fn safe_tenant_segment(tenant: &TenantId) -> bool {
    let s = tenant.as_str();
    !s.contains('/') && !s.contains('\\') && s != "." && s != ".."
}

/// Turn one exported object into a [`SourceRecord`].
pub fn record_from_export(entity_type: EntityType, value: Value) -> Result<SourceRecord, String> {
    let Value::Object(mut fields) = value else {
        return Err("record is not a JSON object".to_string());
    };

    let entity_id = match fields.remove("id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err("record has no `id`".to_string()),
    };

    let related = match fields.remove("related") {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    let updated_at = match fields.remove("updated_at") {
        Some(Value::String(s)) => Some(
            DateTime::parse_from_rfc3339(&s)
                .map_err(|e| format!("record {}: bad updated_at: {}", entity_id, e))?
                .with_timezone(&Utc),
        ),
        _ => None,
    };

    Ok(SourceRecord {
        entity_type,
        entity_id,
        fields,
        related,
        updated_at,
    })
}

#[async_trait]
impl RecordSource for JsonFileSource {
    fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    async fn list_records(&self, tenant: &TenantId) -> Result<Vec<SourceRecord>, SourceError> {
        if !safe_tenant_segment(tenant) {
            return Err(SourceError::Failed(
                self.entity_type,
                format!("tenant id {:?} is not a valid directory name", tenant.as_str()),
            ));
        }

        let path = self.path_for(tenant);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::Unavailable(
                    self.entity_type,
                    format!("{} not found", path.display()),
                ));
            }
            Err(e) => {
                return Err(SourceError::Failed(
                    self.entity_type,
                    format!("{}: {}", path.display(), e),
                ))
            }
        };

        let items: Vec<Value> = serde_json::from_str(&raw).map_err(|e| {
            SourceError::Failed(self.entity_type, format!("{}: {}", path.display(), e))
        })?;

        debug!(path = %path.display(), count = items.len(), "loaded export");

        items
            .into_iter()
            .map(|item| {
                record_from_export(self.entity_type, item)
                    .map_err(|e| SourceError::Failed(self.entity_type, e))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_record_from_export_lifts_reserved_keys() {
        let record = record_from_export(
            EntityType::Task,
            json!({
                "id": 42,
                "title": "Call client ABC",
                "updated_at": "2024-05-01T10:00:00Z",
                "related": { "project": { "name": "Renewals" } }
            }),
        )
        .unwrap();

        assert_eq!(record.entity_id, "42");
        assert_eq!(record.text("title").as_deref(), Some("Call client ABC"));
        assert_eq!(record.text("project.name").as_deref(), Some("Renewals"));
        assert!(record.updated_at.is_some());
        assert!(!record.fields.contains_key("related"));
    }

    #[test]
    fn test_record_without_id_is_rejected() {
        assert!(record_from_export(EntityType::Task, json!({ "title": "x" })).is_err());
        assert!(record_from_export(EntityType::Task, json!([1, 2])).is_err());
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let source = JsonFileSource::new(tmp.path(), EntityType::Deal);
        let err = source
            .list_records(&TenantId::new("acme").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(EntityType::Deal, _)));
    }

    #[tokio::test]
    async fn test_reads_tenant_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("acme")).unwrap();
        std::fs::write(
            tmp.path().join("acme").join("inbox_item.json"),
            r#"[{"id": "i-1", "content": "Buy printer toner"}]"#,
        )
        .unwrap();

        let source = JsonFileSource::new(tmp.path(), EntityType::InboxItem);
        let records = source
            .list_records(&TenantId::new("acme").unwrap())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entity_type, EntityType::InboxItem);
    }

    #[tokio::test]
    async fn test_malformed_file_fails() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("acme")).unwrap();
        std::fs::write(tmp.path().join("acme").join("task.json"), "{not json").unwrap();

        let source = JsonFileSource::new(tmp.path(), EntityType::Task);
        let err = source
            .list_records(&TenantId::new("acme").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Failed(EntityType::Task, _)));
    }

    #[tokio::test]
    async fn test_path_traversal_tenant_is_refused() {
        let tmp = TempDir::new().unwrap();
        let source = JsonFileSource::new(tmp.path(), EntityType::Task);
        let err = source
            .list_records(&TenantId::new("../etc").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Failed(..)));
    }
}
