//! In-memory cache of chart-repository index metadata.
//!
//! One shard exists per registered repository. Lookups are served from
//! memory; a miss triggers an index refresh through the coalescing
//! [`Queue`](crate::queue::Queue), so any number of concurrent misses for one
//! repository produce a single download of its index document.

pub mod entry;
pub mod index;
mod shard;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;

pub use entry::RepoEntry;
pub use index::{ChartVersion, Index};
use shard::Shard;

use crate::queue::{self, Queue};
use crate::transport::Transport;
use crate::urls::{AppendUrlError, append_url};
use crate::versions;

/// Failures of an index refresh, delivered to every waiter of the coalesced
/// refresh, hence `Clone`.
#[derive(Error, Debug, Clone)]
pub enum RefreshError {
    /// The refresh was requested for an unregistered repository.
    #[error("Repository is not in cache: {0}")]
    MissingRepository(String),
    /// The index URL could not be formed from the repository base URL.
    #[error("Failed to append url: {0}")]
    UrlJoin(#[from] AppendUrlError),
    /// The index document could not be downloaded.
    #[error("Failed to download index for {0}: {1}")]
    Download(String, Arc<crate::transport::Error>),
    /// The index document could not be parsed.
    #[error("Failed to parse index for {0}: {1}")]
    Parse(String, Arc<serde_yml::Error>),
}

/// Failures of metadata lookups.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The repository name was never registered. Lookups do not create
    /// repositories implicitly.
    #[error("Repository is not in cache: {0}")]
    MissingRepository(String),
    /// The index refresh for a cache miss failed.
    #[error("Failed to refresh repository {0}: {1}")]
    Refresh(String, #[source] queue::Error<RefreshError>),
}

/// The top-level repository map, shared between the cache and the refresh
/// worker. The worker holds this map and the transport; the queue itself
/// holds no reference back to any cache layer.
struct Shards {
    contents: RwLock<HashMap<String, Arc<Shard>>>,
}

impl Shards {
    fn get(&self, name: &str) -> Option<Arc<Shard>> {
        let contents = self
            .contents
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        contents.get(name).map(Arc::clone)
    }
}

/// Downloads and parses a repository index, then replaces the shard's
/// contents. Invoked only through the queue, so at most once concurrently
/// per repository.
struct RefreshWorker {
    shards: Arc<Shards>,
    transport: Arc<Transport>,
}

#[async_trait]
impl queue::Worker for RefreshWorker {
    type Error = RefreshError;

    async fn work(&self, key: &str) -> Result<(), RefreshError> {
        let shard = self
            .shards
            .get(key)
            .ok_or_else(|| RefreshError::MissingRepository(key.to_owned()))?;

        let entry = shard.repository().clone();
        let url = append_url(&entry.url, "index.yaml")?;
        tracing::debug!(repository = %key, url = %url, "refreshing repository index");

        let body = self
            .transport
            .fetch(&url, &entry.transport_options())
            .await
            .map_err(|e| RefreshError::Download(key.to_owned(), Arc::new(e)))?;

        let index = serde_yml::from_slice::<Index>(&body)
            .map_err(|e| RefreshError::Parse(key.to_owned(), Arc::new(e)))?;

        shard.load(&index);
        Ok(())
    }
}

/// The repository metadata cache.
pub struct Cache {
    shards: Arc<Shards>,
    queue: Queue<RefreshWorker>,
}

impl Cache {
    /// Returns a cache refreshing through `transport` with default cooldown
    /// and timeout.
    #[must_use]
    pub fn new(transport: Arc<Transport>) -> Self {
        Self::with_config(queue::Config::default(), transport)
    }

    /// Returns a cache with explicit refresh cooldown and timeout settings.
    #[must_use]
    pub fn with_config(config: queue::Config, transport: Arc<Transport>) -> Self {
        let shards = Arc::new(Shards {
            contents: RwLock::new(HashMap::new()),
        });
        let worker = RefreshWorker {
            shards: Arc::clone(&shards),
            transport,
        };
        Self {
            shards,
            queue: Queue::new(config, worker),
        }
    }

    /// Registers a repository, creating an empty shard for it.
    ///
    /// Registration is idempotent: re-registering a name with an unchanged
    /// URL is a no-op and keeps any cached metadata. A changed URL replaces
    /// the entry and starts over with an empty shard. No refresh is
    /// triggered either way.
    pub fn register(&self, entry: RepoEntry) {
        let mut contents = self
            .shards
            .contents
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = contents.get(&entry.name) {
            if existing.repository().url == entry.url {
                return;
            }
            tracing::info!(
                repository = %entry.name,
                url = %entry.url,
                "repository URL changed, discarding cached metadata"
            );
        } else {
            tracing::info!(repository = %entry.name, url = %entry.url, "repository registered");
        }

        contents.insert(entry.name.clone(), Arc::new(Shard::new(entry)));
    }

    /// Returns the registered entry for `repository`.
    ///
    /// # Errors
    ///
    /// [`Error::MissingRepository`] when the name was never registered.
    pub fn repository(&self, repository: &str) -> Result<RepoEntry, Error> {
        let shard = self
            .shards
            .get(repository)
            .ok_or_else(|| Error::MissingRepository(repository.to_owned()))?;
        Ok(shard.repository().clone())
    }

    /// Retrieves the record for a chart version, refreshing the repository
    /// index on a cache miss.
    ///
    /// A miss that persists after a successful refresh means the chart
    /// version does not exist in that repository; this is reported as
    /// `Ok(None)`, not as an error.
    ///
    /// # Errors
    ///
    /// [`Error::MissingRepository`] for an unregistered repository, and
    /// [`Error::Refresh`] when the index download or parse fails.
    pub async fn lookup(
        &self,
        repository: &str,
        chart: &str,
        version: &str,
    ) -> Result<Option<Arc<ChartVersion>>, Error> {
        let shard = self
            .shards
            .get(repository)
            .ok_or_else(|| Error::MissingRepository(repository.to_owned()))?;

        if let Some(record) = shard.get(chart, version) {
            return Ok(Some(record));
        }

        tracing::debug!(repository, chart, version, "metadata cache miss");
        self.refresh(repository).await?;

        // The shard may have been replaced by a concurrent re-registration;
        // resolve it again rather than reusing the handle from above.
        let shard = self
            .shards
            .get(repository)
            .ok_or_else(|| Error::MissingRepository(repository.to_owned()))?;
        Ok(shard.get(chart, version))
    }

    /// Returns the highest semantic version available for `chart`,
    /// refreshing the repository index when the chart is not cached at all.
    ///
    /// # Errors
    ///
    /// [`Error::MissingRepository`] for an unregistered repository, and
    /// [`Error::Refresh`] when the index download or parse fails.
    pub async fn newest_version(
        &self,
        repository: &str,
        chart: &str,
    ) -> Result<Option<versions::Version>, Error> {
        let shard = self
            .shards
            .get(repository)
            .ok_or_else(|| Error::MissingRepository(repository.to_owned()))?;

        if !shard.has_chart(chart) {
            tracing::debug!(repository, chart, "metadata cache miss");
            self.refresh(repository).await?;
        }

        let shard = self
            .shards
            .get(repository)
            .ok_or_else(|| Error::MissingRepository(repository.to_owned()))?;
        Ok(shard.newest_version(chart))
    }

    /// Replaces a repository's cached metadata from a parsed index.
    ///
    /// This is the bulk-replace half of the refresh cycle; it is public so
    /// warm-up paths and tests can seed a shard without network access.
    ///
    /// # Errors
    ///
    /// [`Error::MissingRepository`] when the name was never registered.
    pub fn load(&self, repository: &str, index: &Index) -> Result<(), Error> {
        let shard = self
            .shards
            .get(repository)
            .ok_or_else(|| Error::MissingRepository(repository.to_owned()))?;
        shard.load(index);
        Ok(())
    }

    async fn refresh(&self, repository: &str) -> Result<(), Error> {
        self.queue
            .request(repository)
            .await
            .map_err(|e| Error::Refresh(repository.to_owned(), e))
    }
}
