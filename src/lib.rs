// Copyright (C) 2022 Electronic Arts, Inc. All rights reserved.

//! Coalesced, two-tier cache of Helm chart repositories.
//!
//! Three layers, each depending only on the one below:
//!
//! - [`queue`]: a request-coalescing scheduler guaranteeing at most one
//!   in-flight refresh per key, with cooldown and timeout.
//! - [`repos`]: an in-memory cache of chart-repository index metadata,
//!   refreshing through the scheduler so concurrent misses share one index
//!   download.
//! - [`charts`]: an on-disk LRU cache of downloaded chart archives,
//!   resolving download locations through the metadata cache.
//!
//! The crate is a library: it owns no CLI and no wire protocol, and is
//! embedded by reconciliation and admission layers that register
//! repositories and ask for chart archives.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use chartcache::{ChartReference, charts, repos, transport::Transport};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(Transport::new());
//!
//! let metadata = Arc::new(repos::Cache::new(Arc::clone(&transport)));
//! metadata.register(repos::RepoEntry::new(
//!     "stable",
//!     url::Url::parse("https://charts.example.com/stable")?,
//! ));
//!
//! let cache = charts::Cache::new(
//!     charts::Config::new("/var/cache/charts"),
//!     Arc::clone(&metadata),
//!     transport,
//! )?;
//!
//! let reference = ChartReference {
//!     repository: "stable".to_string(),
//!     chart: "app".to_string(),
//!     version: semver::Version::new(1, 2, 3),
//! };
//! let unpacked = cache.unpack(&reference).await?;
//! // ... render templates from unpacked.path() ...
//! unpacked.cleanup()?;
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

pub mod charts;
pub mod queue;
pub mod repos;
pub mod transport;
pub mod urls;
pub mod versions;

use serde::{Deserialize, Serialize};

use versions::Version;

/// A reference to a chart at a specific version within a named repository.
///
/// This is the shape the consuming controllers carry in their custom
/// resources and hand to [`charts::Cache::unpack`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChartReference {
    /// Registered repository name.
    pub repository: String,
    /// Chart name.
    pub chart: String,
    /// Chart version.
    pub version: Version,
}

impl std::fmt::Display for ChartReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.repository, self.chart, self.version)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn chart_reference_round_trips_through_yaml() {
        let reference = ChartReference {
            repository: "stable".to_string(),
            chart: "app".to_string(),
            version: Version::new(1, 2, 3),
        };

        let yaml = serde_yml::to_string(&reference).unwrap();
        let parsed: ChartReference = serde_yml::from_str(&yaml).unwrap();

        assert_eq!(parsed, reference);
        assert_eq!(reference.to_string(), "stable/app:1.2.3");
    }
}
