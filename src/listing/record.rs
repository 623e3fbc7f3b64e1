use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::agent::ObjectLayout;

/// Field names the sidecar owns; caller metadata may not use them.
pub const RESERVED_FIELDS: [&str; 3] = ["backup_id", "size", "created_at"];

/// One stored backup, as reconstructed from its metadata sidecar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupRecord {
    pub backup_id: String,
    pub archive_key: String,
    pub metadata_key: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    /// Caller-supplied fields, echoed back unchanged.
    pub metadata: Map<String, Value>,
}

/// The `<id>.metadata.json` document stored next to each archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataSidecar {
    pub backup_id: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MetadataSidecar {
    pub fn new(
        backup_id: &str,
        size: u64,
        created_at: DateTime<Utc>,
        mut metadata: Map<String, Value>,
    ) -> Self {
        for field in RESERVED_FIELDS {
            if metadata.remove(field).is_some() {
                warn!(backup_id, field, "dropping reserved field from caller metadata");
            }
        }
        MetadataSidecar {
            backup_id: backup_id.to_string(),
            size,
            created_at,
            extra: metadata,
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn from_slice(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }

    pub fn into_record(self, layout: &ObjectLayout) -> BackupRecord {
        BackupRecord {
            archive_key: layout.archive_key(&self.backup_id),
            metadata_key: layout.metadata_key(&self.backup_id),
            backup_id: self.backup_id,
            size: self.size,
            created_at: self.created_at,
            metadata: self.extra,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_sidecar_document_shape() -> anyhow::Result<()> {
        let created_at = DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")?.with_timezone(&Utc);
        let sidecar = MetadataSidecar::new(
            "nightly",
            1024,
            created_at,
            as_map(json!({ "name": "Nightly", "protected": false })),
        );

        let document: Value = serde_json::from_slice(&sidecar.to_bytes()?)?;
        assert_eq!(
            document,
            json!({
                "backup_id": "nightly",
                "size": 1024,
                "created_at": "2026-03-01T12:00:00Z",
                "name": "Nightly",
                "protected": false,
            })
        );
        assert_eq!(MetadataSidecar::from_slice(&sidecar.to_bytes()?)?, sidecar);
        Ok(())
    }

    #[test]
    fn test_reserved_fields_are_dropped() {
        let sidecar = MetadataSidecar::new(
            "a",
            7,
            Utc::now(),
            as_map(json!({ "size": 99, "backup_id": "b", "label": "x" })),
        );
        assert_eq!(sidecar.size, 7);
        assert_eq!(sidecar.backup_id, "a");
        assert_eq!(sidecar.extra, as_map(json!({ "label": "x" })));
    }

    #[test]
    fn test_sidecar_missing_fields_is_rejected() {
        assert!(MetadataSidecar::from_slice(br#"{"backup_id":"a"}"#).is_err());
        assert!(MetadataSidecar::from_slice(b"not json").is_err());
    }

    #[test]
    fn test_record_keys_follow_layout() {
        let layout = ObjectLayout::new("home");
        let record = MetadataSidecar::new("x1", 3, Utc::now(), Map::new()).into_record(&layout);
        assert_eq!(record.archive_key, "home/backups/x1.tar");
        assert_eq!(record.metadata_key, "home/backups/x1.metadata.json");
    }
}
