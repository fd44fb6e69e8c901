//! Repository index document parsing.
use std::collections::HashMap;

use serde::Deserialize;

/// A chart version record from an index document.
///
/// Records are never mutated after parsing; a refresh replaces a shard's
/// records wholesale.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartVersion {
    /// Chart name.
    pub name: String,
    /// Chart version.
    pub version: String,
    /// Download URLs, absolute or relative to the repository base URL.
    #[serde(default)]
    pub urls: Vec<String>,
    /// Chart description.
    #[serde(default)]
    pub description: Option<String>,
    /// Archive digest, when the repository publishes one.
    #[serde(default)]
    pub digest: Option<String>,
    /// When the version was published.
    #[serde(default)]
    pub created: Option<chrono::DateTime<chrono::FixedOffset>>,
    /// Any further chart metadata the repository publishes (home, sources,
    /// dependencies, ...).
    #[serde(flatten)]
    pub metadata: HashMap<String, serde_yml::Value>,
}

/// A parsed repository index document.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    /// Index schema version.
    #[serde(default)]
    pub api_version: Option<String>,
    /// Chart name to available versions.
    pub entries: HashMap<String, Vec<ChartVersion>>,
    /// When the index was generated.
    #[serde(default)]
    pub generated: Option<chrono::DateTime<chrono::FixedOffset>>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use chrono::DateTime;

    use super::*;

    #[test]
    fn test_deserialize_index() {
        let index = r"
apiVersion: v1
entries:
  alpine:
    - created: 2016-10-06T16:23:20.499814565-06:00
      description: Deploy a basic Alpine Linux pod
      digest: 99c76e403d752c84ead610644d4b1c2f2b453a74b921f422b9dcb8a7c8b559cd
      home: https://helm.sh/helm
      name: alpine
      sources:
      - https://github.com/helm/helm
      urls:
      - https://technosophos.github.io/tscharts/alpine-0.2.0.tgz
      version: 0.2.0
    - created: 2016-10-06T16:23:20.499543808-06:00
      description: Deploy a basic Alpine Linux pod
      digest: 515c58e5f79d8b2913a10cb400ebb6fa9c77fe813287afbacf1a0b897cd78727
      home: https://helm.sh/helm
      name: alpine
      sources:
      - https://github.com/helm/helm
      urls:
      - https://technosophos.github.io/tscharts/alpine-0.1.0.tgz
      version: 0.1.0
  nginx:
    - created: 2016-10-06T16:23:20.499543808-06:00
      description: Create a basic nginx HTTP server
      digest: aaff4545f79d8b2913a10cb400ebb6fa9c77fe813287afbacf1a0b897cdffffff
      home: https://helm.sh/helm
      name: nginx
      sources:
      - https://github.com/helm/charts
      urls:
      - charts/nginx-1.1.0.tgz
      version: 1.1.0
generated: 2016-10-06T16:23:20.499029981-06:00
";
        let index = serde_yml::from_str::<Index>(index).unwrap();
        assert_eq!(index.api_version.as_deref(), Some("v1"));
        assert_eq!(index.entries.len(), 2);
        assert_eq!(
            index.generated,
            Some(DateTime::parse_from_rfc3339("2016-10-06T16:23:20.499029981-06:00").unwrap())
        );

        let alpine = &index.entries["alpine"];
        assert_eq!(alpine.len(), 2);
        assert_eq!(alpine[0].version, "0.2.0");
        assert_eq!(
            alpine[0].metadata["home"],
            serde_yml::Value::String("https://helm.sh/helm".to_string())
        );

        let nginx = &index.entries["nginx"];
        assert_eq!(nginx[0].urls, vec!["charts/nginx-1.1.0.tgz".to_string()]);
    }

    #[test]
    fn test_deserialize_index_without_optional_fields() {
        let index = "
entries:
  app:
    - name: app
      version: 0.1.0
      urls:
      - app-0.1.0.tgz
";
        let index = serde_yml::from_str::<Index>(index).unwrap();
        let app = &index.entries["app"][0];
        assert_eq!(app.name, "app");
        assert_eq!(app.version, "0.1.0");
        assert!(app.description.is_none());
        assert!(app.created.is_none());
    }
}
