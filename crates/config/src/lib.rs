//! Layered configuration for shelf.
//!
//! Sources, lowest priority first:
//!
//! 1. Built-in defaults (everything under the platform data directory, local
//!    object storage).
//! 2. A configuration file. TOML, YAML or JSON, chosen by extension. When no
//!    path is given, `config.toml` in the platform config directory is used
//!    if it exists.
//! 3. Environment variables prefixed with `SHELF_`, with `__` separating
//!    nested keys: `SHELF_STORAGE__KIND=s3`, `SHELF_RECONCILE__BATCH_SIZE=50`.

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "SHELF_";
/// Longest a reconciliation pass may wait for its first event.
const MAX_WAIT_LIMIT_SECS: u64 = 3600;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "shelf")
}

fn data_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default().join(".shelf"))
}

/// Where the configuration file is looked for when none is given.
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub catalog: CatalogConfig,
    pub events: EventsConfig,
    pub reconcile: ReconcileConfig,
    pub service: ServiceConfig,
}
impl Default for Config {
    fn default() -> Self {
        let data = data_dir();
        Self {
            storage: StorageConfig::Local { root: data.join("objects") },
            catalog: CatalogConfig { database: data.join("catalog.db") },
            events: EventsConfig { database: data.join("events.db"), ..EventsConfig::default() },
            reconcile: ReconcileConfig::default(),
            service: ServiceConfig::default(),
        }
    }
}

/// Which object store holds book content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default = "default_region")]
        region: String,
        /// Custom endpoint for S3-compatible services.
        #[serde(default)]
        endpoint: Option<String>,
        key_id: String,
        key_secret: String,
    },
    Local {
        root: PathBuf,
    },
}

fn default_region() -> String {
    "auto".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub database: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// NATS server URL (`nats://host:4222`). When set, events go through
    /// JetStream and `database` is unused.
    pub url: Option<String>,
    pub database: PathBuf,
    /// How long a fetched event may stay unacknowledged before redelivery.
    pub ack_wait_secs: u64,
    /// How often a waiting consumer re-checks for events published by other
    /// processes.
    pub poll_interval_ms: u64,
}
impl Default for EventsConfig {
    fn default() -> Self {
        Self { url: None, database: data_dir().join("events.db"), ack_wait_secs: 30, poll_interval_ms: 1000 }
    }
}
impl EventsConfig {
    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Most deletion events handled per pass.
    pub batch_size: usize,
    /// Longest a pass waits for the first event.
    pub max_wait_secs: u64,
}
impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { batch_size: 100, max_wait_secs: 60 }
    }
}
impl ReconcileConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Upper bound on each catalog read.
    pub timeout_secs: u64,
}
impl Default for ServiceConfig {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}
impl ServiceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load and validate configuration from every source.
    ///
    /// An explicitly given file must exist. The default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) if !path.is_file() => exn::bail!(ErrorKind::MissingFile(path.to_path_buf())),
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path().filter(|path| path.is_file()),
        };
        if let Some(file) = &file {
            tracing::debug!(path = %file.display(), "reading configuration file");
        }
        Self::from_figment(Self::figment(file.as_deref()).merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Defaults with an optional file merged on top.
    pub fn figment(file: Option<&Path>) -> Figment {
        let figment = Figment::from(Serialized::defaults(Config::default()));
        let Some(file) = file else {
            return figment;
        };
        match file.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => figment.merge(Yaml::file(file)),
            Some("json") => figment.merge(Json::file(file)),
            _ => figment.merge(Toml::file(file)),
        }
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would parse but cannot work.
    pub fn validate(&self) -> Result<()> {
        match &self.storage {
            StorageConfig::S3 { bucket, .. } if bucket.trim().is_empty() => {
                exn::bail!(ErrorKind::Invalid("storage.bucket"))
            },
            StorageConfig::Local { root } if !root.is_absolute() => exn::bail!(ErrorKind::Invalid("storage.root")),
            _ => {},
        }
        let checks = [
            (self.reconcile.batch_size == 0, "reconcile.batch_size"),
            (self.reconcile.max_wait_secs == 0, "reconcile.max_wait_secs"),
            (self.reconcile.max_wait_secs > MAX_WAIT_LIMIT_SECS, "reconcile.max_wait_secs"),
            (self.service.timeout_secs == 0, "service.timeout_secs"),
            (self.events.ack_wait_secs == 0, "events.ack_wait_secs"),
            (self.events.poll_interval_ms == 0, "events.poll_interval_ms"),
            (self.events.url.as_ref().is_some_and(|url| url.trim().is_empty()), "events.url"),
        ];
        if let Some((_, field)) = checks.into_iter().find(|(failed, _)| *failed) {
            exn::bail!(ErrorKind::Invalid(field));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    fn write(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::File::create(&path).unwrap().write_all(contents.as_bytes()).unwrap();
        path
    }

    fn absolute(name: &str) -> PathBuf {
        std::env::temp_dir().join(name)
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_figment(Config::figment(None)).unwrap();
        assert_eq!(config.reconcile.batch_size, 100);
        assert_eq!(config.reconcile.max_wait(), Duration::from_secs(60));
        assert_eq!(config.service.timeout(), Duration::from_secs(10));
        assert_eq!(config.events.ack_wait(), Duration::from_secs(30));
        assert_eq!(config.events.poll_interval(), Duration::from_secs(1));
        assert!(matches!(config.storage, StorageConfig::Local { .. }));
    }

    #[test]
    fn test_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "config.toml",
            r#"
                [storage]
                kind = "s3"
                bucket = "books"
                endpoint = "http://localhost:9000"
                key_id = "id"
                key_secret = "secret"

                [reconcile]
                batch_size = 25
            "#,
        );
        let config = Config::from_figment(Config::figment(Some(&path))).unwrap();
        assert_eq!(config.reconcile.batch_size, 25);
        // Untouched keys in the same section keep their defaults.
        assert_eq!(config.reconcile.max_wait_secs, 60);
        let StorageConfig::S3 { bucket, region, endpoint, prefix, .. } = config.storage else {
            panic!("expected s3 storage");
        };
        assert_eq!(bucket, "books");
        assert_eq!(region, "auto");
        assert_eq!(endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(prefix, None);
    }

    #[test]
    fn test_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = absolute("shelf-objects");
        let path = write(
            &dir,
            "config.yaml",
            &format!("storage:\n  kind: local\n  root: {}\nservice:\n  timeout_secs: 3\n", root.display()),
        );
        let config = Config::from_figment(Config::figment(Some(&path))).unwrap();
        assert_eq!(config.service.timeout(), Duration::from_secs(3));
        assert_eq!(config.storage, StorageConfig::Local { root });
    }

    #[test]
    fn test_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.json", r#"{"events": {"ack_wait_secs": 5}}"#);
        let config = Config::from_figment(Config::figment(Some(&path))).unwrap();
        assert_eq!(config.events.ack_wait(), Duration::from_secs(5));
        assert_eq!(config.events.poll_interval_ms, 1000);
        assert_eq!(config.events.url, None);
    }

    #[test]
    fn test_events_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.toml", "[events]\nurl = \"nats://localhost:4222\"\n");
        let config = Config::from_figment(Config::figment(Some(&path))).unwrap();
        assert_eq!(config.events.url.as_deref(), Some("nats://localhost:4222"));
        assert_eq!(config.events.ack_wait_secs, 30);
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = Config::load(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::MissingFile(_)));
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.toml", "[reconcile]\nbatch_size = \"lots\"\n");
        let err = Config::from_figment(Config::figment(Some(&path))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Load));
    }

    #[rstest]
    #[case("[reconcile]\nbatch_size = 0", "reconcile.batch_size")]
    #[case("[reconcile]\nmax_wait_secs = 0", "reconcile.max_wait_secs")]
    #[case("[reconcile]\nmax_wait_secs = 86400", "reconcile.max_wait_secs")]
    #[case("[service]\ntimeout_secs = 0", "service.timeout_secs")]
    #[case("[events]\nurl = \"\"", "events.url")]
    #[case("[events]\nack_wait_secs = 0", "events.ack_wait_secs")]
    #[case("[events]\npoll_interval_ms = 0", "events.poll_interval_ms")]
    #[case("[storage]\nkind = \"local\"\nroot = \"relative/dir\"", "storage.root")]
    #[case("[storage]\nkind = \"s3\"\nbucket = \"\"\nkey_id = \"a\"\nkey_secret = \"b\"", "storage.bucket")]
    fn test_invalid_values(#[case] contents: &str, #[case] field: &str) {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.toml", contents);
        let err = Config::from_figment(Config::figment(Some(&path))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(f) if *f == field), "{err:?}");
    }
}
