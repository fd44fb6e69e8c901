//! Per-repository in-memory metadata.
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::entry::RepoEntry;
use super::index::{ChartVersion, Index};
use crate::versions;

type Contents = HashMap<String, HashMap<String, Arc<ChartVersion>>>;

/// The in-memory chart metadata for a single repository.
///
/// Contents are replaced wholesale by [`Shard::load`]; they are never merged
/// incrementally, so versions removed upstream disappear on the next refresh.
pub(super) struct Shard {
    repository: RepoEntry,
    contents: RwLock<Contents>,
}

impl Shard {
    pub(super) fn new(repository: RepoEntry) -> Self {
        Self {
            repository,
            contents: RwLock::new(HashMap::new()),
        }
    }

    pub(super) fn repository(&self) -> &RepoEntry {
        &self.repository
    }

    /// Returns the record for `name` at `version`, if cached.
    pub(super) fn get(&self, name: &str, version: &str) -> Option<Arc<ChartVersion>> {
        let contents = self
            .contents
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        contents.get(name)?.get(version).map(Arc::clone)
    }

    /// Returns the highest semantic version cached for `name`.
    ///
    /// Versions that do not parse as semver are skipped.
    pub(super) fn newest_version(&self, name: &str) -> Option<versions::Version> {
        let contents = self
            .contents
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        contents
            .get(name)?
            .keys()
            .filter_map(|version| versions::parse_version(version).ok())
            .max()
    }

    /// Whether any version of `name` is cached.
    pub(super) fn has_chart(&self, name: &str) -> bool {
        let contents = self
            .contents
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        contents.contains_key(name)
    }

    /// Replaces the shard's contents from a parsed index.
    pub(super) fn load(&self, index: &Index) {
        let mut replacement: Contents = HashMap::with_capacity(index.entries.len());
        let mut version_count = 0;
        for (name, chart_versions) in &index.entries {
            let versions = replacement.entry(name.clone()).or_default();
            for chart_version in chart_versions {
                versions.insert(
                    chart_version.version.clone(),
                    Arc::new(chart_version.clone()),
                );
                version_count += 1;
            }
        }

        let mut contents = self
            .contents
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *contents = replacement;

        tracing::info!(
            repository = %self.repository.name,
            charts = contents.len(),
            versions = version_count,
            "repository metadata replaced"
        );
    }
}
