// cloudstash/src/config/mod.rs
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use url::Url;

use crate::errors::AgentError;

pub const FALLBACK_REGION: &str = "us-east-1";
pub const FALLBACK_PREFIX: &str = "homeassistant";

static BUCKET_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$").expect("valid regex"));
static IPV4_LIKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}$").expect("valid regex"));
static REGION_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("valid regex"));
// s3.<region>.amazonaws.com, s3-<region>.amazonaws.com, s3.dualstack.<region>.amazonaws.com
static AWS_REGIONAL_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\.)s3[.-](?:dualstack\.)?([a-z]{2}(?:-[a-z]+)+-\d+)\.amazonaws\.com$")
        .expect("valid regex")
});

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub s3_storage: Option<JsonS3StorageConfig>,
}

/// Timeouts handed to the S3 client; `None` keeps the SDK default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientTimeouts {
    pub operation: Option<Duration>,
    pub connect: Option<Duration>,
}

/// Validated connection parameters for one bucket. Immutable: a changed
/// descriptor means a new gateway.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    endpoint_url: String,
    region: String,
    access_key_id: String,
    secret_access_key: String,
    bucket_name: String,
    prefix: String,
    timeouts: ClientTimeouts,
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("endpoint_url", &self.endpoint_url)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("bucket_name", &self.bucket_name)
            .field("prefix", &self.prefix)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

/// Builder-style input for [`ConnectionDescriptor::new`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionSettings {
    pub endpoint_url: String,
    pub region: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub prefix: Option<String>,
    pub timeouts: ClientTimeouts,
}

impl ConnectionDescriptor {
    pub fn new(settings: ConnectionSettings) -> crate::errors::Result<Self> {
        let endpoint_url = normalise_endpoint(&settings.endpoint_url)?;

        let region = settings
            .region
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| FALLBACK_REGION.to_string());
        validate_region(&region, &endpoint_url)?;

        let bucket_name = settings.bucket_name.trim().to_string();
        validate_bucket_name(&bucket_name)?;

        let access_key_id = settings.access_key_id.trim().to_string();
        if access_key_id.is_empty() {
            return Err(AgentError::InvalidConfiguration(
                "access key id cannot be empty".to_string(),
            ));
        }
        if settings.secret_access_key.is_empty() {
            return Err(AgentError::InvalidConfiguration(
                "secret access key cannot be empty".to_string(),
            ));
        }

        let prefix = settings
            .prefix
            .as_deref()
            .unwrap_or(FALLBACK_PREFIX)
            .trim()
            .trim_matches('/')
            .to_string();

        Ok(ConnectionDescriptor {
            endpoint_url,
            region,
            access_key_id,
            secret_access_key: settings.secret_access_key,
            bucket_name,
            prefix,
            timeouts: settings.timeouts,
        })
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    /// Object-key prefix without surrounding slashes; may be empty.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn timeouts(&self) -> ClientTimeouts {
        self.timeouts
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub connection: ConnectionDescriptor,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        Self::from_json_str(&config_content).with_context(|| {
            format!(
                "Failed to load configuration from {}",
                config_path.display()
            )
        })
    }

    pub fn from_json_str(config_content: &str) -> Result<Self> {
        let raw_json_config: RawJsonConfig =
            serde_json::from_str(config_content).context("Failed to parse JSON configuration")?;
        let s3_raw = raw_json_config
            .s3_storage
            .context("s3_storage must be set in config.json")?;
        let connection = descriptor_from_json(&s3_raw)?;

        Ok(AppConfig { connection })
    }
}

/// Converts the `s3_storage` block into a validated descriptor.
pub fn descriptor_from_json(
    s3_raw: &JsonS3StorageConfig,
) -> crate::errors::Result<ConnectionDescriptor> {
    fn required(value: &Option<String>, field: &str) -> crate::errors::Result<String> {
        value
            .as_ref()
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .ok_or_else(|| {
                AgentError::InvalidConfiguration(format!(
                    "{} must be set in s3_storage",
                    field
                ))
            })
    }

    ConnectionDescriptor::new(ConnectionSettings {
        endpoint_url: required(&s3_raw.endpoint_url, "endpoint_url")?,
        region: s3_raw.region.clone(),
        access_key_id: required(&s3_raw.access_key_id, "access_key_id")?,
        secret_access_key: required(&s3_raw.secret_access_key, "secret_access_key")?,
        bucket_name: required(&s3_raw.bucket_name, "bucket_name")?,
        prefix: s3_raw.folder_prefix.clone(),
        timeouts: ClientTimeouts {
            operation: s3_raw.request_timeout_secs.map(Duration::from_secs),
            connect: s3_raw.connect_timeout_secs.map(Duration::from_secs),
        },
    })
}

/// Trims the endpoint, drops a trailing slash and defaults the scheme to https.
pub fn normalise_endpoint(raw: &str) -> crate::errors::Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AgentError::InvalidConfiguration(
            "endpoint URL cannot be empty".to_string(),
        ));
    }

    let lowered = trimmed.to_ascii_lowercase();
    let endpoint = if lowered.starts_with("http://") || lowered.starts_with("https://") {
        trimmed.trim_end_matches('/').to_string()
    } else if let Some((scheme, _)) = trimmed.split_once("://") {
        return Err(AgentError::InvalidConfiguration(format!(
            "unsupported endpoint URL scheme '{}' (expected http or https)",
            scheme
        )));
    } else {
        format!("https://{}", trimmed.trim_end_matches('/'))
    };

    let parsed = Url::parse(&endpoint).map_err(|e| {
        AgentError::InvalidConfiguration(format!("invalid endpoint URL '{}': {}", endpoint, e))
    })?;
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(AgentError::InvalidConfiguration(format!(
            "endpoint URL '{}' has no host",
            endpoint
        )));
    }
    Ok(endpoint)
}

pub fn validate_bucket_name(bucket: &str) -> crate::errors::Result<()> {
    let invalid = |reason: &str| {
        Err(AgentError::InvalidConfiguration(format!(
            "invalid bucket name '{}': {}",
            bucket, reason
        )))
    };

    if !BUCKET_NAME.is_match(bucket) {
        return invalid(concat!(
            "must be 3-63 characters of lowercase letters, digits, dots or hyphens, ",
            "starting and ending with a letter or digit"
        ));
    }
    if bucket.contains("..") {
        return invalid("must not contain consecutive dots");
    }
    if IPV4_LIKE.is_match(bucket) {
        return invalid("must not be formatted as an IP address");
    }
    if bucket.starts_with("xn--") || bucket.ends_with("-s3alias") {
        return invalid("uses a reserved prefix or suffix");
    }
    Ok(())
}

fn validate_region(region: &str, endpoint_url: &str) -> crate::errors::Result<()> {
    if !REGION_NAME.is_match(region) {
        return Err(AgentError::InvalidConfiguration(format!(
            "invalid region identifier '{}'",
            region
        )));
    }

    let host = Url::parse(endpoint_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase));
    if let Some(captures) = host.as_deref().and_then(|h| AWS_REGIONAL_HOST.captures(h)) {
        let endpoint_region = &captures[1];
        if endpoint_region != region {
            return Err(AgentError::InvalidConfiguration(format!(
                "region '{}' does not match endpoint region '{}'",
                region, endpoint_region
            )));
        }
    }
    Ok(())
}
