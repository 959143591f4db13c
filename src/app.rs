//! Wiring: turn a [`Config`] into live handles.

use miette::{Result, miette};
use shelf_catalog::{Database, Repository};
use shelf_config::{Config, EventsConfig, StorageConfig};
use shelf_events::{ChannelHandle, NatsChannel, SqliteChannel};
use shelf_library::{BookService, Reconciler, ReconcilerConfig, events};
use shelf_storage::BackendHandle;
use shelf_storage::backend::{LocalBackend, S3Backend};
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

/// Attach a short description to a failure and render its full error tree.
pub trait Report<T> {
    fn report(self, context: &str) -> Result<T>;
}
impl<T, E: Debug> Report<T> for std::result::Result<T, E> {
    fn report(self, context: &str) -> Result<T> {
        self.map_err(|e| miette!("{context}: {e:?}"))
    }
}

pub struct App {
    pub config: Config,
    pub storage: BackendHandle,
    pub channel: ChannelHandle,
    pub service: BookService,
    catalog: Database,
    /// Set when events live in a local SQLite log rather than on a NATS server.
    event_log: Option<Arc<SqliteChannel>>,
}

impl App {
    pub async fn open(config: Config) -> Result<Self> {
        ensure_parent(&config.catalog.database).await?;
        let catalog = Database::connect(&config.catalog.database).await.report("opening the catalog")?;
        let (channel, event_log) = event_channel(&config.events).await?;
        events::ensure_stream(&channel).await.report("declaring the book stream")?;
        let storage = storage_backend(&config.storage)?;
        tracing::debug!(backend = storage.name(), "storage ready");
        let service = BookService::new(Repository::from(&catalog), storage.clone(), channel.clone())
            .with_timeout(config.service.timeout());
        Ok(Self { config, storage, channel, service, catalog, event_log })
    }

    pub async fn reconciler(&self) -> Result<Reconciler> {
        let config = ReconcilerConfig {
            batch_size: self.config.reconcile.batch_size,
            max_wait: self.config.reconcile.max_wait(),
            ack_wait: self.config.events.ack_wait(),
        };
        Reconciler::new(self.channel.clone(), self.storage.clone(), config).await.report("starting the reconciler")
    }

    pub async fn close(&self) {
        self.catalog.close().await;
        if let Some(event_log) = &self.event_log {
            event_log.close().await;
        }
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.report(&format!("creating {}", parent.display()))?;
    }
    Ok(())
}

async fn event_channel(config: &EventsConfig) -> Result<(ChannelHandle, Option<Arc<SqliteChannel>>)> {
    if let Some(url) = &config.url {
        let channel: ChannelHandle =
            Arc::new(NatsChannel::connect(url).await.report(&format!("connecting to {url}"))?);
        return Ok((channel, None));
    }
    ensure_parent(&config.database).await?;
    let event_log = Arc::new(
        SqliteChannel::connect(&config.database)
            .await
            .report("opening the event log")?
            .with_poll_interval(config.poll_interval()),
    );
    let channel: ChannelHandle = event_log.clone();
    Ok((channel, Some(event_log)))
}

fn storage_backend(config: &StorageConfig) -> Result<BackendHandle> {
    Ok(match config {
        StorageConfig::S3 { bucket, prefix, region, endpoint, key_id, key_secret } => Arc::new(
            S3Backend::new("s3", bucket, prefix.clone(), region, endpoint.clone(), key_id, key_secret)
                .report("configuring S3 storage")?,
        ),
        StorageConfig::Local { root } => {
            Arc::new(LocalBackend::new("local", root).report("configuring local storage")?)
        },
    })
}
