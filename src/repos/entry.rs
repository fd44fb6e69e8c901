//! Repository registration records.
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::transport;

/// A configured chart repository.
///
/// Entries are supplied externally, from `Repository` custom resources or
/// config files, and are immutable once registered.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoEntry {
    /// Unique repository name.
    pub name: String,
    /// Base URL; the index document lives at `<url>/index.yaml`.
    pub url: Url,
    /// Basic-auth username.
    #[serde(default)]
    pub username: Option<String>,
    /// Basic-auth password.
    #[serde(default)]
    pub password: Option<String>,
    /// PEM client certificate file.
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    /// PEM client key file.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// PEM CA bundle file.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// Skip server certificate verification.
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

impl RepoEntry {
    /// Returns an entry with only a name and URL set.
    #[must_use]
    pub fn new(name: impl Into<String>, url: Url) -> Self {
        Self {
            name: name.into(),
            url,
            username: None,
            password: None,
            cert_file: None,
            key_file: None,
            ca_file: None,
            insecure_skip_tls_verify: false,
        }
    }

    /// The transport options this repository's downloads are made with.
    #[must_use]
    pub fn transport_options(&self) -> transport::Options<'_> {
        transport::Options {
            username: self.username.as_deref(),
            password: self.password.as_deref(),
            cert_file: self.cert_file.as_deref(),
            key_file: self.key_file.as_deref(),
            ca_file: self.ca_file.as_deref(),
            insecure_skip_tls_verify: self.insecure_skip_tls_verify,
        }
    }
}
