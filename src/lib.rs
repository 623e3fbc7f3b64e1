//! Backup-storage connector for S3-compatible object stores.
//!
//! [`BackupAgent`] stores opaque backup archives with a JSON metadata sidecar,
//! lists them through a time-bounded cache, streams them back and removes them.
//! All remote calls run on a dedicated storage thread behind
//! [`storage::StorageGateway`].

pub mod agent;
pub mod archive;
pub mod config;
pub mod errors;
pub mod listing;
pub mod storage;
pub mod upload;

pub use agent::{ArchiveStream, BackupAgent, ObjectLayout};
pub use config::{AppConfig, ConnectionDescriptor, ConnectionSettings};
pub use errors::{AgentError, ErrorKind, Result};
pub use listing::BackupRecord;
