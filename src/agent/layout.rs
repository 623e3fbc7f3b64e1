use crate::errors::{AgentError, Result};

/// Fixed folder between the prefix and the backup objects.
pub const STORAGE_DIR: &str = "backups";
pub const ARCHIVE_SUFFIX: &str = ".tar";
pub const METADATA_SUFFIX: &str = ".metadata.json";

/// What a key under the root refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutEntry {
    Archive(String),
    Metadata(String),
}

/// Object naming: `<prefix>/backups/<id>.tar` and
/// `<prefix>/backups/<id>.metadata.json`. An empty prefix puts `backups/` at
/// the bucket root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLayout {
    root: String,
}

impl ObjectLayout {
    pub fn new(prefix: &str) -> Self {
        let prefix = prefix.trim_matches('/');
        let root = if prefix.is_empty() {
            format!("{}/", STORAGE_DIR)
        } else {
            format!("{}/{}/", prefix, STORAGE_DIR)
        };
        ObjectLayout { root }
    }

    /// Listing prefix, always ending in `/`.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn archive_key(&self, backup_id: &str) -> String {
        format!("{}{}{}", self.root, backup_id, ARCHIVE_SUFFIX)
    }

    pub fn metadata_key(&self, backup_id: &str) -> String {
        format!("{}{}{}", self.root, backup_id, METADATA_SUFFIX)
    }

    /// Map a listed key back to its backup id. Keys outside the root, in
    /// nested folders, or with other suffixes yield `None`.
    pub fn classify(&self, key: &str) -> Option<LayoutEntry> {
        let name = key.strip_prefix(self.root.as_str())?;
        if name.contains('/') {
            return None;
        }
        // `.metadata.json` first: it does not end in `.tar`, but an id may.
        if let Some(id) = name.strip_suffix(METADATA_SUFFIX) {
            return (!id.is_empty()).then(|| LayoutEntry::Metadata(id.to_string()));
        }
        if let Some(id) = name.strip_suffix(ARCHIVE_SUFFIX) {
            return (!id.is_empty()).then(|| LayoutEntry::Archive(id.to_string()));
        }
        None
    }
}

/// Reject ids that would escape the root or produce unusable keys.
pub fn validate_backup_id(backup_id: &str) -> Result<()> {
    let problem = if backup_id.is_empty() {
        Some("must not be empty")
    } else if backup_id == "." || backup_id == ".." {
        Some("must not be a relative path component")
    } else if backup_id.contains('/') {
        Some("must not contain '/'")
    } else if backup_id.chars().any(char::is_control) {
        Some("must not contain control characters")
    } else {
        None
    };

    match problem {
        Some(reason) => Err(AgentError::InvalidConfiguration(format!(
            "backup id {:?} {}",
            backup_id, reason
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_keys_under_prefix() {
        let layout = ObjectLayout::new("/homeassistant/");
        assert_eq!(layout.root(), "homeassistant/backups/");
        assert_eq!(layout.archive_key("abc123"), "homeassistant/backups/abc123.tar");
        assert_eq!(
            layout.metadata_key("abc123"),
            "homeassistant/backups/abc123.metadata.json"
        );
    }

    #[test]
    fn test_empty_prefix_uses_bucket_root() {
        let layout = ObjectLayout::new("");
        assert_eq!(layout.archive_key("x"), "backups/x.tar");
        assert_eq!(ObjectLayout::new("/"), layout);
    }

    #[test]
    fn test_nested_prefix() {
        let layout = ObjectLayout::new("team/site-a");
        assert_eq!(layout.metadata_key("b"), "team/site-a/backups/b.metadata.json");
    }

    #[test]
    fn test_classify() {
        let layout = ObjectLayout::new("p");
        assert_eq!(
            layout.classify("p/backups/a.tar"),
            Some(LayoutEntry::Archive("a".into()))
        );
        assert_eq!(
            layout.classify("p/backups/a.metadata.json"),
            Some(LayoutEntry::Metadata("a".into()))
        );
        assert_eq!(
            layout.classify("p/backups/a.tar.metadata.json"),
            Some(LayoutEntry::Metadata("a.tar".into()))
        );
        assert_eq!(layout.classify("p/backups/.tar"), None);
        assert_eq!(layout.classify("p/backups/a.zip"), None);
        assert_eq!(layout.classify("p/backups/sub/a.tar"), None);
        assert_eq!(layout.classify("q/backups/a.tar"), None);
    }

    #[test]
    fn test_backup_id_validation() {
        for good in ["abc", "2026-01-01_full", "a.b", "with space"] {
            assert!(validate_backup_id(good).is_ok(), "{}", good);
        }
        for bad in ["", ".", "..", "a/b", "line\nbreak", "tab\t"] {
            let err = validate_backup_id(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidConfiguration, "{:?}", bad);
        }
    }
}
