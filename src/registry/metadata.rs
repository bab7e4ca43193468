use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::oci::{self, HelmChart, ImageConfig};

pub const LABEL_LICENSES: &str = "org.opencontainers.image.licenses";
pub const LABEL_URL: &str = "org.opencontainers.image.url";
pub const LABEL_SOURCE: &str = "org.opencontainers.image.source";
pub const LABEL_DOCUMENTATION: &str = "org.opencontainers.image.documentation";
pub const LABEL_DESCRIPTION: &str = "org.opencontainers.image.description";
pub const LABEL_AUTHORS: &str = "org.opencontainers.image.authors";

pub const UNKNOWN_PLATFORM: &str = "unknown";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    #[default]
    Oci,
    Helm,
}

/// Child manifest of a multi-platform index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestReference {
    pub platform: String,
    pub digest: String,
    pub size: i64,
}

/// Portable metadata serialized onto each package version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "type")]
    pub image_type: ImageType,
    pub is_tagged: bool,
    pub platform: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub documentation_url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layer_creation: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<ManifestReference>,
    /// Platform to child manifest digest, in index order.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub multi_arch: IndexMap<String, String>,
}

/// How a config blob is to be read, keyed on its media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    Image,
    Helm,
}

impl ConfigKind {
    pub fn from_media_type(media_type: &str) -> Self {
        if media_type.eq_ignore_ascii_case(oci::MEDIA_TYPE_HELM_CONFIG) {
            ConfigKind::Helm
        } else {
            ConfigKind::Image
        }
    }
}

impl Metadata {
    /// Extract metadata from a manifest's config blob.
    pub fn from_config(media_type: &str, content: &[u8]) -> serde_json::Result<Self> {
        match ConfigKind::from_media_type(media_type) {
            ConfigKind::Helm => Ok(Self::from_helm_chart(serde_json::from_slice(content)?)),
            ConfigKind::Image => Ok(Self::from_image_config(serde_json::from_slice(content)?)),
        }
    }

    /// Empty metadata for an index; children are added with [`Metadata::add_manifest`].
    pub fn for_index() -> Self {
        Self {
            platform: UNKNOWN_PLATFORM.to_string(),
            ..Default::default()
        }
    }

    pub fn add_manifest(&mut self, platform: String, digest: String, size: i64) {
        self.multi_arch.insert(platform.clone(), digest.clone());
        self.manifests.push(ManifestReference { platform, digest, size });
    }

    fn from_image_config(image: ImageConfig) -> Self {
        let platform = if image.os.is_empty() || image.architecture.is_empty() {
            UNKNOWN_PLATFORM.to_string()
        } else {
            oci::Platform {
                architecture: image.architecture,
                os: image.os,
                variant: image.variant,
            }
            .to_string()
        };

        let labels: BTreeMap<String, String> = image
            .config
            .and_then(|config| config.labels)
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();
        let label = |name: &str| labels.get(name).cloned().unwrap_or_default();

        let layer_creation = image
            .history
            .iter()
            .filter_map(|entry| entry.created_by.as_deref())
            .map(strip_nop_prefix)
            .filter(|command| !command.is_empty())
            .map(str::to_string)
            .collect();

        Self {
            image_type: ImageType::Oci,
            platform,
            description: label(LABEL_DESCRIPTION),
            authors: labels.get(LABEL_AUTHORS).cloned().into_iter().collect(),
            license: label(LABEL_LICENSES),
            project_url: label(LABEL_URL),
            repository_url: label(LABEL_SOURCE),
            documentation_url: label(LABEL_DOCUMENTATION),
            layer_creation,
            labels,
            ..Default::default()
        }
    }

    fn from_helm_chart(chart: HelmChart) -> Self {
        Self {
            image_type: ImageType::Helm,
            platform: UNKNOWN_PLATFORM.to_string(),
            description: chart.description,
            authors: chart
                .maintainers
                .into_iter()
                .map(|m| m.name)
                .filter(|name| !name.is_empty())
                .collect(),
            project_url: chart.home,
            repository_url: chart.sources.into_iter().next().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// `/bin/sh -c #(nop) CMD ["sh"]` becomes `CMD ["sh"]`.
fn strip_nop_prefix(command: &str) -> &str {
    const NOP: &str = "#(nop) ";
    match command.find(NOP) {
        Some(index) => command[index + NOP.len()..].trim(),
        None => command.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_config_metadata() {
        let config = br#"{
            "architecture": "arm64",
            "os": "linux",
            "variant": "v8",
            "config": {"Labels": {
                "org.opencontainers.image.authors": "Alice",
                "org.opencontainers.image.licenses": "MIT",
                "org.opencontainers.image.description": "demo image",
                "org.opencontainers.image.source": "https://example.com/src"
            }},
            "history": [
                {"created_by": "/bin/sh -c #(nop) ADD file:abc in / "},
                {"created_by": "/bin/sh -c #(nop)  CMD [\"sh\"]", "empty_layer": true},
                {"created_by": "RUN make"},
                {}
            ]
        }"#;
        let metadata = Metadata::from_config("application/vnd.oci.image.config.v1+json", config).unwrap();
        assert_eq!(metadata.image_type, ImageType::Oci);
        assert_eq!(metadata.platform, "linux/arm64/v8");
        assert_eq!(metadata.authors, vec!["Alice".to_string()]);
        assert_eq!(metadata.license, "MIT");
        assert_eq!(metadata.description, "demo image");
        assert_eq!(metadata.repository_url, "https://example.com/src");
        assert_eq!(
            metadata.layer_creation,
            vec!["ADD file:abc in /", "CMD [\"sh\"]", "RUN make"]
        );
    }

    #[test]
    fn test_missing_platform_is_unknown() {
        let metadata = Metadata::from_config("application/vnd.oci.image.config.v1+json", b"{}").unwrap();
        assert_eq!(metadata.platform, UNKNOWN_PLATFORM);
    }

    #[test]
    fn test_helm_config_metadata() {
        let config = br#"{
            "name": "chart",
            "version": "1.0.0",
            "description": "a chart",
            "home": "https://example.com",
            "sources": ["https://example.com/git"],
            "maintainers": [{"name": "bob"}, {"email": "x@example.com"}]
        }"#;
        let metadata = Metadata::from_config(oci::MEDIA_TYPE_HELM_CONFIG, config).unwrap();
        assert_eq!(metadata.image_type, ImageType::Helm);
        assert_eq!(metadata.description, "a chart");
        assert_eq!(metadata.project_url, "https://example.com");
        assert_eq!(metadata.repository_url, "https://example.com/git");
        assert_eq!(metadata.authors, vec!["bob".to_string()]);
    }

    #[test]
    fn test_serialized_type_tag() {
        let mut metadata = Metadata::for_index();
        metadata.add_manifest("linux/amd64".into(), "sha256:aa".into(), 10);
        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["type"], "oci");
        assert_eq!(json["multi_arch"]["linux/amd64"], "sha256:aa");
        assert_eq!(json["manifests"][0]["size"], 10);
    }
}
