//! On-disk LRU cache of downloaded chart archives.
//!
//! Archives land at `<root>/<repository>/<chart>/<chart>-<version>.tgz`. An
//! index insert past capacity evicts the least-recently-used entry and
//! deletes its backing file in the same locked step, so the index never
//! points at a deleted file and no file outlives its index entry.
//!
//! Downloads for one chart version are coalesced through their own
//! [`Queue`](crate::queue::Queue), and the download itself runs outside the
//! index lock, so concurrent first-time requests for a chart neither race
//! each other nor serialize unrelated cache traffic.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use lru::LruCache;
use thiserror::Error;
use uuid::Uuid;

use crate::ChartReference;
use crate::queue::{self, Queue};
use crate::repos;
use crate::transport::{self, Transport};
use crate::urls::{AppendUrlError, resolve_chart_url};
use crate::versions::Version;

/// Default number of archives kept on disk.
pub const DEFAULT_CACHE_DEPTH: NonZeroUsize = match NonZeroUsize::new(128) {
    Some(depth) => depth,
    None => unreachable!(),
};

/// Failures of a coalesced archive download, delivered to every waiter,
/// hence `Clone`.
#[derive(Error, Debug, Clone)]
pub enum DownloadError {
    /// Metadata resolution failed.
    #[error(transparent)]
    Metadata(#[from] repos::Error),
    /// The chart version does not exist in the repository index.
    #[error("Chart not found: {repository}/{chart}:{version}")]
    ChartNotFound {
        /// Repository name.
        repository: String,
        /// Chart name.
        chart: String,
        /// Requested version.
        version: String,
    },
    /// The index record carries no download URLs.
    #[error("Chart {0} has no download urls")]
    NoDownloadUrls(String),
    /// The download URL could not be resolved against the repository base.
    #[error("Failed to resolve chart url: {0}")]
    ResolveUrl(#[from] AppendUrlError),
    /// The archive could not be downloaded.
    #[error("Failed to download archive: {0}")]
    Transport(Arc<transport::Error>),
    /// The archive could not be written to the cache directory.
    #[error("IO error {0}: {1}")]
    Io(PathBuf, Arc<std::io::Error>),
    /// The download key did not name a chart version. This should not occur
    /// through the public [`Cache::archive`] contract.
    #[error("Invalid download key {0:?}")]
    Key(String),
}

/// Failures of archive retrieval and unpacking.
#[derive(Error, Debug)]
pub enum Error {
    /// The cache directory could not be created.
    #[error("Failed to create cache directory {0}: {1}")]
    Root(PathBuf, #[source] std::io::Error),
    /// The coalesced download failed.
    #[error("Failed to download chart archive {0}: {1}")]
    Download(String, #[source] queue::Error<DownloadError>),
    /// An unpack directory could not be created or removed.
    #[error("IO error {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    /// The archive could not be expanded.
    #[error("Failed to expand archive {0}: {1}")]
    Expand(PathBuf, #[source] std::io::Error),
}

/// Tarball cache configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory the cache lives under; created if absent.
    pub root: PathBuf,
    /// Maximum number of archives kept on disk. Fixed for the life of the
    /// cache.
    pub capacity: NonZeroUsize,
    /// Cooldown and timeout settings for the download queue.
    pub queue: queue::Config,
}

impl Config {
    /// Returns a configuration with default capacity and queue settings.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            capacity: DEFAULT_CACHE_DEPTH,
            queue: queue::Config::default(),
        }
    }
}

type ArchiveIndex = Mutex<LruCache<PathBuf, ()>>;

/// Resolves, downloads, and stores one chart archive, then records it in the
/// LRU index. Invoked only through the queue, so at most once concurrently
/// per chart version.
struct DownloadWorker {
    root: PathBuf,
    repos: Arc<repos::Cache>,
    transport: Arc<Transport>,
    lru: Arc<ArchiveIndex>,
}

impl DownloadWorker {
    /// Records a downloaded archive, evicting the least-recently-used entry
    /// past capacity. The evicted file is deleted under the index lock so
    /// the two cannot diverge; a failed delete is logged and swallowed
    /// rather than failing the insert that triggered it.
    fn insert(&self, destination: PathBuf) {
        let mut lru = self.lru.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((evicted, ())) = lru.push(destination.clone(), ()) {
            if evicted == destination {
                return;
            }
            tracing::debug!(path = %evicted.display(), "evicting least-recently-used archive");
            if let Err(err) = std::fs::remove_file(&evicted) {
                tracing::warn!(
                    path = %evicted.display(),
                    error = %err,
                    "failed to remove evicted archive"
                );
            }
        }
    }
}

#[async_trait]
impl queue::Worker for DownloadWorker {
    type Error = DownloadError;

    async fn work(&self, key: &str) -> Result<(), DownloadError> {
        let mut parts = key.splitn(3, ':');
        let (Some(repository), Some(chart), Some(version)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(DownloadError::Key(key.to_owned()));
        };

        let entry = self.repos.repository(repository)?;
        let record = self
            .repos
            .lookup(repository, chart, version)
            .await?
            .ok_or_else(|| DownloadError::ChartNotFound {
                repository: repository.to_owned(),
                chart: chart.to_owned(),
                version: version.to_owned(),
            })?;

        let reference = record
            .urls
            .first()
            .ok_or_else(|| DownloadError::NoDownloadUrls(chart.to_owned()))?;
        let url = resolve_chart_url(&entry.url, reference)?;

        tracing::info!(repository, chart, version, url = %url, "downloading chart archive");
        let body = self
            .transport
            .fetch(&url, &entry.transport_options())
            .await
            .map_err(|e| DownloadError::Transport(Arc::new(e)))?;

        let destination = destination(&self.root, repository, chart, version);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::Io(parent.to_path_buf(), Arc::new(e)))?;
        }
        tokio::fs::write(&destination, &body)
            .await
            .map_err(|e| DownloadError::Io(destination.clone(), Arc::new(e)))?;

        self.insert(destination);
        Ok(())
    }
}

/// An unpacked chart archive.
///
/// The caller owns the unpack directory and must call [`Unpacked::cleanup`]
/// on every exit path once done with the contents; dropping the value
/// without it leaks the directory.
#[must_use]
pub struct Unpacked {
    path: PathBuf,
    root: PathBuf,
}

impl Unpacked {
    /// The unpacked chart directory (`.../<chart>`).
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recursively removes the unpack directory.
    ///
    /// # Errors
    ///
    /// Any filesystem error removing the tree.
    pub fn cleanup(self) -> Result<(), std::io::Error> {
        std::fs::remove_dir_all(&self.root)
    }
}

/// The disk-backed chart archive cache.
pub struct Cache {
    root: PathBuf,
    lru: Arc<ArchiveIndex>,
    queue: Queue<DownloadWorker>,
}

impl Cache {
    /// Returns a cache rooted at `config.root`, resolving metadata through
    /// `repos` and downloading through `transport`.
    ///
    /// # Errors
    ///
    /// [`Error::Root`] when the cache directory cannot be created.
    pub fn new(
        config: Config,
        repos: Arc<repos::Cache>,
        transport: Arc<Transport>,
    ) -> Result<Self, Error> {
        std::fs::create_dir_all(&config.root)
            .map_err(|e| Error::Root(config.root.clone(), e))?;

        let lru = Arc::new(Mutex::new(LruCache::new(config.capacity)));
        let worker = DownloadWorker {
            root: config.root.clone(),
            repos,
            transport,
            lru: Arc::clone(&lru),
        };

        Ok(Self {
            root: config.root,
            lru,
            queue: Queue::new(config.queue, worker),
        })
    }

    /// Returns the local path of a chart archive, downloading it on a cache
    /// miss.
    ///
    /// A hit promotes the entry's recency and returns the path unchanged
    /// with no network access. Concurrent misses for the same chart version
    /// share a single download.
    ///
    /// # Errors
    ///
    /// [`Error::Download`] carrying the metadata, transport, or filesystem
    /// failure of the coalesced download.
    pub async fn archive(
        &self,
        repository: &str,
        chart: &str,
        version: &Version,
    ) -> Result<PathBuf, Error> {
        let version = version.to_string();
        let destination = destination(&self.root, repository, chart, &version);

        {
            let mut lru = self.lru.lock().unwrap_or_else(PoisonError::into_inner);
            if lru.get(&destination).is_some() {
                return Ok(destination);
            }
        }

        let key = format!("{repository}:{chart}:{version}");
        tracing::debug!(repository, chart, version, "archive cache miss");
        self.queue
            .request(&key)
            .await
            .map_err(|e| Error::Download(key, e))?;

        Ok(destination)
    }

    /// Downloads a chart archive and expands it into a fresh unpack
    /// directory.
    ///
    /// The returned handle's [`path`](Unpacked::path) is the chart directory
    /// inside the unpacked tree; its [`cleanup`](Unpacked::cleanup) must be
    /// called on every exit path.
    ///
    /// # Errors
    ///
    /// [`Error::Download`] from archive retrieval, [`Error::Io`] creating
    /// the unpack directory, or [`Error::Expand`] expanding the archive.
    pub async fn unpack(&self, reference: &ChartReference) -> Result<Unpacked, Error> {
        let source = self
            .archive(
                &reference.repository,
                &reference.chart,
                &reference.version,
            )
            .await?;

        let root = self
            .root
            .join("unpacked")
            .join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::Io(root.clone(), e))?;

        expand(&source, &root).map_err(|e| Error::Expand(source.clone(), e))?;

        Ok(Unpacked {
            path: root.join(&reference.chart),
            root,
        })
    }
}

fn destination(root: &Path, repository: &str, chart: &str, version: &str) -> PathBuf {
    root.join(repository)
        .join(chart)
        .join(format!("{chart}-{version}.tgz"))
}

fn expand(source: &Path, target: &Path) -> Result<(), std::io::Error> {
    let file = std::fs::File::open(source)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.unpack(target)
}
