//! Catalog client: fetches and normalizes the plugin catalog document.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::Deserialize;

use crate::error::{HostError, Result};
use crate::store::is_valid_id;
use crate::version::parse_version;

/// Catalog format major version this client understands.
pub const CATALOG_FORMAT_MAJOR: u64 = 1;

/// Where a catalog or archive lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    /// `http://` or `https://` URL
    Http(String),
    /// Local file (`file://` URL or plain path)
    File(PathBuf),
}

impl SourceLocation {
    /// Classify a location string.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let lower = raw.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            SourceLocation::Http(raw.to_string())
        } else if let Some(path) = raw.strip_prefix("file://") {
            SourceLocation::File(PathBuf::from(path))
        } else {
            SourceLocation::File(PathBuf::from(raw))
        }
    }

    /// Resolve a location found inside a document fetched from `self`.
    ///
    /// Absolute URLs and absolute paths are returned as-is; relative ones are
    /// joined onto the directory of this location.
    pub fn join(&self, raw: &str) -> SourceLocation {
        let raw = raw.trim();
        let child = SourceLocation::parse(raw);
        let relative = matches!(&child, SourceLocation::File(p) if !p.is_absolute())
            && !raw.starts_with("file://");
        if !relative {
            return child;
        }

        match self {
            SourceLocation::Http(base) => reqwest::Url::parse(base)
                .and_then(|u| u.join(raw))
                .map(|u| SourceLocation::Http(u.to_string()))
                .unwrap_or(child),
            SourceLocation::File(base) => {
                let dir = base.parent().unwrap_or_else(|| Path::new("."));
                SourceLocation::File(dir.join(raw))
            }
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocation::Http(url) => write!(f, "{}", url),
            SourceLocation::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Version requirement attached to a dependency.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VersionConstraint {
    /// Any installed version satisfies the dependency
    Any,
    /// Installed version must be at least this
    AtLeast(Version),
    /// Installed version must equal this
    Exactly(Version),
}

impl VersionConstraint {
    /// Check an available version against the constraint.
    pub fn is_satisfied_by(&self, available: &Version) -> bool {
        match self {
            VersionConstraint::Any => true,
            VersionConstraint::AtLeast(min) => available >= min,
            VersionConstraint::Exactly(v) => available == v,
        }
    }
}

/// A package name plus a minimum-version constraint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DependencySpec {
    /// Normalized package name (lowercase, `-` folded to `_`)
    pub name: String,
    pub constraint: VersionConstraint,
}

impl DependencySpec {
    /// Parse `"pandas>=1.3.0"`, `"pillow==9.0"` or a bare `"requests"`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (name, constraint) = if let Some((name, v)) = raw.split_once(">=") {
            (name, VersionConstraint::AtLeast(parse_version(v)?))
        } else if let Some((name, v)) = raw.split_once("==") {
            (name, VersionConstraint::Exactly(parse_version(v)?))
        } else {
            (raw, VersionConstraint::Any)
        };

        let name = normalize_package_name(name);
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
            return None;
        }
        Some(Self { name, constraint })
    }
}

impl fmt::Display for DependencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.constraint {
            VersionConstraint::Any => write!(f, "{}", self.name),
            VersionConstraint::AtLeast(v) => write!(f, "{}>={}", self.name, v),
            VersionConstraint::Exactly(v) => write!(f, "{}=={}", self.name, v),
        }
    }
}

/// Normalize a package name the way the runtime environment keys them.
pub fn normalize_package_name(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace('-', "_")
}

/// Immutable metadata for one plugin version in a catalog snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: Version,
    pub author: String,
    pub category: String,
    /// Archive location, already resolved against the catalog location
    pub source: SourceLocation,
    pub dependencies: Vec<DependencySpec>,
    pub icon: Option<String>,
    pub screenshots: Vec<String>,
    /// Declared archive size in bytes
    pub file_size: Option<u64>,
    pub min_app_version: Option<Version>,
    /// Optional hex SHA-256 of the archive
    pub sha256: Option<String>,
    /// Display-only data (rating, download count, ...) the host shows as-is
    pub display: BTreeMap<String, serde_json::Value>,
}

impl PluginDescriptor {
    /// Whether a host at `host_version` can run this plugin.
    pub fn is_compatible_with(&self, host_version: Option<&Version>) -> bool {
        match (&self.min_app_version, host_version) {
            (Some(min), Some(host)) => host >= min,
            _ => true,
        }
    }
}

/// A catalog snapshot. Rebuilt on every refresh.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub format_version: String,
    /// Separate version-check endpoint, if the catalog advertises one
    pub update_url: Option<String>,
    plugins: Vec<PluginDescriptor>,
    /// Entries dropped because they were malformed or duplicated
    pub skipped: usize,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    version: Option<serde_json::Value>,
    update_url: Option<String>,
    plugins: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    id: Option<String>,
    name: Option<String>,
    description: Option<String>,
    version: Option<String>,
    author: Option<String>,
    category: Option<String>,
    url: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    icon: Option<String>,
    #[serde(default)]
    screenshots: Vec<String>,
    file_size: Option<u64>,
    min_app_version: Option<String>,
    sha256: Option<String>,
    #[serde(flatten)]
    display: BTreeMap<String, serde_json::Value>,
}

impl Catalog {
    /// Parse a catalog document fetched from `origin`.
    pub fn parse(bytes: &[u8], origin: &SourceLocation) -> Result<Self> {
        let raw: RawCatalog = serde_json::from_slice(bytes)
            .map_err(|e| HostError::CatalogMalformed(format!("invalid JSON: {}", e)))?;

        let format_version = match raw.version {
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(HostError::CatalogMalformed(format!(
                    "invalid catalog version: {}",
                    other
                )))
            }
            None => return Err(HostError::CatalogMalformed("missing catalog version".into())),
        };
        match parse_version(&format_version) {
            Some(v) if v.major == CATALOG_FORMAT_MAJOR => {}
            _ => {
                return Err(HostError::CatalogMalformed(format!(
                    "unsupported catalog version: {}",
                    format_version
                )))
            }
        }

        let entries = raw
            .plugins
            .ok_or_else(|| HostError::CatalogMalformed("missing plugins list".into()))?;

        let mut plugins = Vec::with_capacity(entries.len());
        let mut seen = HashSet::new();
        let mut skipped = 0;
        for (index, entry) in entries.into_iter().enumerate() {
            match descriptor_from_value(entry, origin) {
                Ok(d) if seen.insert(d.id.clone()) => plugins.push(d),
                Ok(d) => {
                    tracing::warn!("Skipping duplicate catalog entry #{}: {}", index, d.id);
                    skipped += 1;
                }
                Err(reason) => {
                    tracing::warn!("Skipping malformed catalog entry #{}: {}", index, reason);
                    skipped += 1;
                }
            }
        }

        Ok(Self {
            format_version,
            update_url: raw.update_url,
            plugins,
            skipped,
            fetched_at: Utc::now(),
        })
    }

    /// Descriptors in catalog order.
    pub fn plugins(&self) -> &[PluginDescriptor] {
        &self.plugins
    }

    /// Look up a descriptor by identifier.
    pub fn get(&self, id: &str) -> Option<&PluginDescriptor> {
        self.plugins.iter().find(|p| p.id == id)
    }

    /// Distinct categories in first-seen order.
    pub fn categories(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.plugins
            .iter()
            .map(|p| p.category.as_str())
            .filter(|c| seen.insert(*c))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

fn descriptor_from_value(
    value: serde_json::Value,
    origin: &SourceLocation,
) -> std::result::Result<PluginDescriptor, String> {
    let raw: RawDescriptor = serde_json::from_value(value).map_err(|e| e.to_string())?;

    let id = raw
        .id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or("missing id")?;
    if !is_valid_id(&id) {
        return Err(format!("invalid id: {}", id));
    }
    let version_raw = raw.version.ok_or_else(|| format!("{}: missing version", id))?;
    let version =
        parse_version(&version_raw).ok_or_else(|| format!("{}: invalid version {}", id, version_raw))?;
    let url = raw
        .url
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| format!("{}: missing url", id))?;

    let dependencies = raw
        .dependencies
        .iter()
        .map(|d| DependencySpec::parse(d).ok_or_else(|| format!("{}: invalid dependency {}", id, d)))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let min_app_version = match raw.min_app_version {
        Some(v) => Some(
            parse_version(&v).ok_or_else(|| format!("{}: invalid min_app_version {}", id, v))?,
        ),
        None => None,
    };

    Ok(PluginDescriptor {
        name: raw.name.filter(|s| !s.is_empty()).unwrap_or_else(|| id.clone()),
        description: raw.description.unwrap_or_default(),
        version,
        author: raw.author.unwrap_or_else(|| "Unknown".to_string()),
        category: raw
            .category
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "Other".to_string()),
        source: origin.join(&url),
        dependencies,
        icon: raw.icon,
        screenshots: raw.screenshots,
        file_size: raw.file_size,
        min_app_version,
        sha256: raw.sha256.map(|s| s.to_ascii_lowercase()),
        display: raw.display,
        id,
    })
}

/// Fetches catalogs from a configured location.
///
/// No request is retried; callers decide whether to retry on
/// [`HostError::CatalogUnreachable`].
#[derive(Debug, Clone)]
pub struct CatalogClient {
    source: SourceLocation,
    http: reqwest::Client,
}

impl CatalogClient {
    /// Create a client for `source` with a request timeout.
    pub fn new(source: impl AsRef<str>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HostError::CatalogUnreachable {
                source_location: source.as_ref().to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            source: SourceLocation::parse(source.as_ref()),
            http,
        })
    }

    /// The configured catalog location.
    pub fn source(&self) -> &SourceLocation {
        &self.source
    }

    /// Fetch and parse the catalog.
    pub async fn fetch(&self) -> Result<Catalog> {
        tracing::info!("Fetching plugin catalog from {}", self.source);
        let bytes = self.fetch_bytes().await?;
        let catalog = Catalog::parse(&bytes, &self.source)?;
        tracing::info!(
            "Catalog {} loaded: {} plugins, {} skipped",
            catalog.format_version,
            catalog.len(),
            catalog.skipped
        );
        Ok(catalog)
    }

    async fn fetch_bytes(&self) -> Result<Vec<u8>> {
        let unreachable = |reason: String| HostError::CatalogUnreachable {
            source_location: self.source.to_string(),
            reason,
        };

        match &self.source {
            SourceLocation::File(path) => tokio::fs::read(path)
                .await
                .map_err(|e| unreachable(e.to_string())),
            SourceLocation::Http(url) => {
                let response = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| unreachable(e.to_string()))?;
                let bytes = response.bytes().await.map_err(|e| unreachable(e.to_string()))?;
                Ok(bytes.to_vec())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> SourceLocation {
        SourceLocation::Http("https://tools.example.com/plugins/plugins.json".into())
    }

    const SAMPLE: &str = r#"{
        "version": "1.0",
        "update_url": "https://tools.example.com/plugins/versions.json",
        "plugins": [
            {
                "id": "text_processor",
                "name": "Text Processor",
                "description": "Formatting and encoding helpers",
                "version": "1.0.0",
                "author": "WorkTools Team",
                "category": "Other",
                "url": "https://tools.example.com/plugins/text_processor.zip",
                "dependencies": [],
                "file_size": 4096,
                "rating": 4.5,
                "download_count": 12,
                "min_app_version": "1.1.0"
            },
            {
                "id": "image_watermark",
                "version": "1.0.0",
                "url": "image_watermark.zip",
                "category": "Images",
                "dependencies": ["Pillow>=9.0.0"]
            },
            { "name": "no id", "version": "1.0.0", "url": "x.zip" },
            { "id": "bad_version", "version": "latest", "url": "x.zip" },
            { "id": "text_processor", "version": "2.0.0", "url": "dup.zip" }
        ]
    }"#;

    #[test]
    fn test_parse_catalog_skips_bad_entries() {
        let catalog = Catalog::parse(SAMPLE.as_bytes(), &origin()).unwrap();
        assert_eq!(catalog.format_version, "1.0");
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.skipped, 3);
        assert_eq!(
            catalog.update_url.as_deref(),
            Some("https://tools.example.com/plugins/versions.json")
        );

        let text = catalog.get("text_processor").unwrap();
        assert_eq!(text.version, Version::new(1, 0, 0));
        assert_eq!(text.file_size, Some(4096));
        assert_eq!(text.min_app_version, Some(Version::new(1, 1, 0)));
        assert_eq!(text.display.get("rating"), Some(&serde_json::json!(4.5)));
    }

    #[test]
    fn test_path_like_ids_are_skipped() {
        let doc = r#"{"version": "1.0", "plugins": [
            {"id": "evil", "version": "1.0.0", "url": "evil.zip"},
            {"id": "a..b", "version": "1.0.0", "url": "x.zip"},
            {"id": "../up", "version": "1.0.0", "url": "x.zip"},
            {"id": ".ledger", "version": "1.0.0", "url": "x.zip"}
        ]}"#;
        let catalog = Catalog::parse(doc.as_bytes(), &origin()).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.skipped, 3);
        assert!(catalog.get("evil").is_some());
        assert!(catalog.get("a..b").is_none());
    }

    #[test]
    fn test_defaults_and_relative_url() {
        let catalog = Catalog::parse(SAMPLE.as_bytes(), &origin()).unwrap();
        let wm = catalog.get("image_watermark").unwrap();
        assert_eq!(wm.name, "image_watermark");
        assert_eq!(wm.author, "Unknown");
        assert_eq!(
            wm.source,
            SourceLocation::Http("https://tools.example.com/plugins/image_watermark.zip".into())
        );
        assert_eq!(wm.dependencies[0].name, "pillow");
        assert_eq!(
            wm.dependencies[0].constraint,
            VersionConstraint::AtLeast(Version::new(9, 0, 0))
        );
    }

    #[test]
    fn test_wrong_format_version_is_malformed() {
        let err = Catalog::parse(br#"{"version": "2.0", "plugins": []}"#, &origin()).unwrap_err();
        assert!(matches!(err, HostError::CatalogMalformed(_)));

        let err = Catalog::parse(br#"{"version": "1.0"}"#, &origin()).unwrap_err();
        assert!(matches!(err, HostError::CatalogMalformed(_)));

        let err = Catalog::parse(b"not json", &origin()).unwrap_err();
        assert!(matches!(err, HostError::CatalogMalformed(_)));
    }

    #[test]
    fn test_dependency_spec_parse() {
        let spec = DependencySpec::parse("pandas>=1.3.0").unwrap();
        assert_eq!(spec.to_string(), "pandas>=1.3.0");
        let spec = DependencySpec::parse("python-docx").unwrap();
        assert_eq!(spec.name, "python_docx");
        assert_eq!(spec.constraint, VersionConstraint::Any);
        let spec = DependencySpec::parse("openpyxl==3.0").unwrap();
        assert_eq!(spec.constraint, VersionConstraint::Exactly(Version::new(3, 0, 0)));
        assert!(DependencySpec::parse(">=1.0").is_none());
        assert!(DependencySpec::parse("pandas>=abc").is_none());
    }

    #[test]
    fn test_source_location() {
        assert_eq!(
            SourceLocation::parse("file:///srv/plugins.json"),
            SourceLocation::File(PathBuf::from("/srv/plugins.json"))
        );
        let base = SourceLocation::File(PathBuf::from("/srv/repo/plugins.json"));
        assert_eq!(
            base.join("text_processor.zip"),
            SourceLocation::File(PathBuf::from("/srv/repo/text_processor.zip"))
        );
        assert_eq!(
            base.join("https://cdn.example.com/a.zip"),
            SourceLocation::Http("https://cdn.example.com/a.zip".into())
        );
    }

    #[tokio::test]
    async fn test_fetch_local_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let client = CatalogClient::new(path.to_string_lossy(), Duration::from_secs(5)).unwrap();
        let catalog = client.fetch().await.unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(
            catalog.get("image_watermark").unwrap().source,
            SourceLocation::File(dir.path().join("image_watermark.zip"))
        );
    }

    #[tokio::test]
    async fn test_fetch_missing_file_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let client = CatalogClient::new(
            dir.path().join("missing.json").to_string_lossy(),
            Duration::from_secs(5),
        )
        .unwrap();
        let err = client.fetch().await.unwrap_err();
        assert!(matches!(err, HostError::CatalogUnreachable { .. }));
    }
}
