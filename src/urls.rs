//! URL helpers for repository indexes and chart downloads.
use thiserror::Error;
use url::Url;

/// Failure to combine a repository base URL with a relative path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppendUrlError {
    /// The base URL cannot take path segments (e.g. `mailto:`).
    #[error("Failed to split path into segments")]
    UrlJoin,
}

/// This function appends a path to a URL
///
/// This is required, because url.join has non-desirable
/// behavior when the URL does not end in a slash.
///
/// See <https://github.com/servo/rust-url/pull/934>
///
/// # Errors
///
/// Returns [`AppendUrlError`] when the base URL cannot take path segments.
pub fn append_url(url: &Url, path: &str) -> Result<Url, AppendUrlError> {
    let mut url = url.clone();
    {
        let mut path_segments = url
            .path_segments_mut()
            .map_err(|()| AppendUrlError::UrlJoin)?;
        path_segments.pop_if_empty();
        for segment in path.split('/') {
            path_segments.push(segment);
        }
    }
    Ok(url)
}

/// Resolves a chart download reference against its repository base URL.
///
/// Index documents may carry absolute download URLs, which are used as-is,
/// or URLs relative to the repository base, which are appended to the base
/// path and inherit the base's query string (some repositories carry access
/// tokens there).
///
/// # Errors
///
/// Returns [`AppendUrlError`] when the base URL cannot take path segments.
pub fn resolve_chart_url(base: &Url, reference: &str) -> Result<Url, AppendUrlError> {
    if let Ok(absolute) = Url::parse(reference) {
        return Ok(absolute);
    }

    let mut url = append_url(base, reference)?;
    url.set_query(base.query());
    Ok(url)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn append_url_without_trailing_slash() {
        let base = Url::parse("https://charts.example.com/stable").unwrap();
        let url = append_url(&base, "index.yaml").unwrap();
        assert_eq!(url.as_str(), "https://charts.example.com/stable/index.yaml");
    }

    #[test]
    fn append_url_with_trailing_slash() {
        let base = Url::parse("https://charts.example.com/stable/").unwrap();
        let url = append_url(&base, "index.yaml").unwrap();
        assert_eq!(url.as_str(), "https://charts.example.com/stable/index.yaml");
    }

    #[test]
    fn resolve_relative_reference() {
        let base = Url::parse("https://charts.example.com/stable").unwrap();
        let url = resolve_chart_url(&base, "charts/app-0.1.0.tgz").unwrap();
        assert_eq!(
            url.as_str(),
            "https://charts.example.com/stable/charts/app-0.1.0.tgz"
        );
    }

    #[test]
    fn resolve_relative_reference_keeps_base_query() {
        let base = Url::parse("https://charts.example.com/stable?token=abc").unwrap();
        let url = resolve_chart_url(&base, "app-0.1.0.tgz").unwrap();
        assert_eq!(
            url.as_str(),
            "https://charts.example.com/stable/app-0.1.0.tgz?token=abc"
        );
    }

    #[test]
    fn resolve_absolute_reference_passes_through() {
        let base = Url::parse("https://charts.example.com/stable").unwrap();
        let url = resolve_chart_url(&base, "https://cdn.example.com/app-0.1.0.tgz").unwrap();
        assert_eq!(url.as_str(), "https://cdn.example.com/app-0.1.0.tgz");
    }
}
