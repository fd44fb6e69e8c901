//! Pluggable download transport for index documents and chart archives.
//!
//! Getters are registered per URL scheme; HTTP and HTTPS are built in. A
//! getter receives the per-repository authentication and TLS options carried
//! on the repository entry it is downloading for.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use url::Url;

/// Transport failures.
#[derive(Error, Debug)]
pub enum Error {
    /// No getter is registered for the URL's scheme.
    #[error("no getter supports scheme {0:?}")]
    UnsupportedScheme(String),
    /// The request itself failed: DNS, connection, TLS, or a non-2xx status.
    #[error("Failed to download {0}: {1}")]
    Download(Url, #[source] reqwest::Error),
    /// A TLS certificate or key file could not be read.
    #[error("Failed to read TLS file {0}: {1}")]
    TlsFile(PathBuf, #[source] std::io::Error),
    /// The HTTP client could not be constructed from the given options.
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Per-request authentication and TLS options, borrowed from the owning
/// repository entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct Options<'a> {
    /// Basic-auth username.
    pub username: Option<&'a str>,
    /// Basic-auth password.
    pub password: Option<&'a str>,
    /// PEM client certificate file.
    pub cert_file: Option<&'a Path>,
    /// PEM client key file.
    pub key_file: Option<&'a Path>,
    /// PEM CA bundle file.
    pub ca_file: Option<&'a Path>,
    /// Skip server certificate verification.
    pub insecure_skip_tls_verify: bool,
}

/// Downloads bytes from a URL.
#[async_trait]
pub trait Getter: Send + Sync {
    /// Fetch the document at `url`.
    async fn get(&self, url: &Url, options: &Options<'_>) -> Result<Bytes, Error>;
}

/// The built-in HTTP(S) getter.
///
/// A client is constructed per request so that each repository's TLS
/// configuration applies only to its own downloads.
pub struct HttpGetter {}

impl HttpGetter {
    async fn build_client(options: &Options<'_>) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder().use_rustls_tls();

        if let Some(ca_file) = options.ca_file {
            let pem = tokio::fs::read(ca_file)
                .await
                .map_err(|e| Error::TlsFile(ca_file.to_path_buf(), e))?;
            let certificate = reqwest::Certificate::from_pem(&pem).map_err(Error::Client)?;
            builder = builder.add_root_certificate(certificate);
        }

        if let (Some(cert_file), Some(key_file)) = (options.cert_file, options.key_file) {
            let mut pem = tokio::fs::read(cert_file)
                .await
                .map_err(|e| Error::TlsFile(cert_file.to_path_buf(), e))?;
            let key = tokio::fs::read(key_file)
                .await
                .map_err(|e| Error::TlsFile(key_file.to_path_buf(), e))?;
            pem.extend_from_slice(&key);
            let identity = reqwest::Identity::from_pem(&pem).map_err(Error::Client)?;
            builder = builder.identity(identity);
        }

        if options.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        builder.build().map_err(Error::Client)
    }
}

#[async_trait]
impl Getter for HttpGetter {
    async fn get(&self, url: &Url, options: &Options<'_>) -> Result<Bytes, Error> {
        let client = Self::build_client(options).await?;

        let mut request = client.get(url.clone());
        if let Some(username) = options.username {
            request = request.basic_auth(username, options.password);
        }

        let response = request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Error::Download(url.clone(), e))?;

        response
            .bytes()
            .await
            .map_err(|e| Error::Download(url.clone(), e))
    }
}

/// A registry of getters keyed by URL scheme.
pub struct Transport {
    getters: HashMap<String, Arc<dyn Getter>>,
}

impl Transport {
    /// Returns a transport with the built-in HTTP and HTTPS getters.
    #[must_use]
    pub fn new() -> Self {
        let http: Arc<dyn Getter> = Arc::new(HttpGetter {});
        let mut getters: HashMap<String, Arc<dyn Getter>> = HashMap::new();
        getters.insert("http".to_string(), Arc::clone(&http));
        getters.insert("https".to_string(), http);
        Self { getters }
    }

    /// Registers (or replaces) the getter for `scheme`.
    #[must_use]
    pub fn with_getter(mut self, scheme: &str, getter: Arc<dyn Getter>) -> Self {
        self.getters.insert(scheme.to_string(), getter);
        self
    }

    /// Fetches `url` with the getter registered for its scheme.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedScheme`] when no getter covers the scheme, or any
    /// error from the getter itself.
    pub async fn fetch(&self, url: &Url, options: &Options<'_>) -> Result<Bytes, Error> {
        let getter = self
            .getters
            .get(url.scheme())
            .ok_or_else(|| Error::UnsupportedScheme(url.scheme().to_string()))?;
        getter.get(url, options).await
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let transport = Transport::new();
        let url = Url::parse("oci://registry.example.com/app").unwrap();

        let err = transport.fetch(&url, &Options::default()).await.unwrap_err();

        assert!(matches!(err, Error::UnsupportedScheme(scheme) if scheme == "oci"));
    }

    #[tokio::test]
    async fn registered_getter_takes_over_its_scheme() {
        struct Canned {}

        #[async_trait]
        impl Getter for Canned {
            async fn get(&self, _url: &Url, _options: &Options<'_>) -> Result<Bytes, Error> {
                Ok(Bytes::from_static(b"hello"))
            }
        }

        let transport = Transport::new().with_getter("test", Arc::new(Canned {}));
        let url = Url::parse("test://somewhere/index.yaml").unwrap();

        let body = transport.fetch(&url, &Options::default()).await.unwrap();

        assert_eq!(&body[..], b"hello");
    }
}
