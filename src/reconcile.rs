//! Catalog versus installed-state reconciliation.
//!
//! Pure functions: no IO, no locks. The host feeds in a catalog snapshot and
//! the ledger contents and gets back what to show.

use std::collections::HashMap;

use semver::Version;

use crate::catalog::{Catalog, PluginDescriptor};
use crate::installed::InstalledPlugin;
use crate::version::parse_version;

/// Display status of one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowStatus {
    NotInstalled,
    Installed,
    UpdateAvailable { installed: String },
    /// Installed but no longer listed in the catalog
    LocalOnly,
}

/// One row of the plugin list.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub author: String,
    /// Catalog version, or the installed version for local-only rows
    pub version: String,
    pub file_size: Option<u64>,
    pub status: RowStatus,
    /// Requires a newer host than the one running
    pub incompatible: bool,
}

impl DisplayRow {
    fn from_descriptor(
        descriptor: &PluginDescriptor,
        installed: Option<&InstalledPlugin>,
        host_version: Option<&Version>,
    ) -> Self {
        let status = match installed {
            None => RowStatus::NotInstalled,
            Some(local) => match parse_version(&local.version) {
                Some(v) if v < descriptor.version => RowStatus::UpdateAvailable {
                    installed: local.version.clone(),
                },
                _ => RowStatus::Installed,
            },
        };
        Self {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            description: descriptor.description.clone(),
            category: descriptor.category.clone(),
            author: descriptor.author.clone(),
            version: descriptor.version.to_string(),
            file_size: descriptor.file_size,
            status,
            incompatible: !descriptor.is_compatible_with(host_version),
        }
    }

    fn local_only(plugin: &InstalledPlugin) -> Self {
        Self {
            id: plugin.id.clone(),
            name: plugin.id.clone(),
            description: String::new(),
            category: String::new(),
            author: String::new(),
            version: plugin.version.clone(),
            file_size: None,
            status: RowStatus::LocalOnly,
            incompatible: false,
        }
    }

    pub fn is_installed(&self) -> bool {
        !matches!(self.status, RowStatus::NotInstalled)
    }

    /// Declared size for display, e.g. `15 KB`.
    pub fn size_label(&self) -> Option<String> {
        self.file_size.map(format_size)
    }
}

/// Merge a catalog snapshot with the installed set.
///
/// Rows follow catalog order; installed plugins missing from the catalog
/// are appended as `LocalOnly` in identifier order.
pub fn reconcile(
    catalog: &Catalog,
    installed: &[InstalledPlugin],
    host_version: Option<&Version>,
) -> Vec<DisplayRow> {
    let by_id: HashMap<&str, &InstalledPlugin> =
        installed.iter().map(|p| (p.id.as_str(), p)).collect();

    let mut rows: Vec<DisplayRow> = catalog
        .plugins()
        .iter()
        .map(|d| DisplayRow::from_descriptor(d, by_id.get(d.id.as_str()).copied(), host_version))
        .collect();

    let mut local: Vec<&InstalledPlugin> = installed
        .iter()
        .filter(|p| catalog.get(&p.id).is_none())
        .collect();
    local.sort_by(|a, b| a.id.cmp(&b.id));
    rows.extend(local.into_iter().map(DisplayRow::local_only));
    rows
}

/// Search and category filter for displayed rows.
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    search: Option<String>,
    category: Option<String>,
}

impl RowFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Case-insensitive substring match on name or description.
    pub fn search(mut self, text: impl Into<String>) -> Self {
        let text = text.into().trim().to_lowercase();
        self.search = (!text.is_empty()).then_some(text);
        self
    }

    /// Only rows in `category`.
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn matches(&self, row: &DisplayRow) -> bool {
        if let Some(category) = &self.category {
            if &row.category != category {
                return false;
            }
        }
        match &self.search {
            Some(text) => {
                row.name.to_lowercase().contains(text) || row.description.to_lowercase().contains(text)
            }
            None => true,
        }
    }

    pub fn apply<'a>(&self, rows: &'a [DisplayRow]) -> Vec<&'a DisplayRow> {
        rows.iter().filter(|r| self.matches(r)).collect()
    }
}

/// Render a byte count as `N KB` below one megabyte, `N.N MB` above.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    if bytes < MB {
        format!("{} KB", bytes.div_ceil(KB))
    } else {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SourceLocation;
    use chrono::Utc;
    use std::path::PathBuf;

    const CATALOG: &str = r#"{
        "version": "1.0",
        "plugins": [
            {"id": "text_processor", "name": "Text Processor", "description": "Batch text cleanup",
             "version": "1.0.0", "category": "Text", "url": "text_processor.zip", "file_size": 15360},
            {"id": "file_manager", "name": "File Manager", "description": "Rename files in bulk",
             "version": "1.2.0", "category": "Files", "url": "file_manager.zip", "file_size": 2621440},
            {"id": "image_watermark", "name": "Image Watermark", "description": "Stamp images",
             "version": "1.0.0", "category": "Images", "url": "image_watermark.zip",
             "min_app_version": "3.0.0"}
        ]
    }"#;

    fn catalog() -> Catalog {
        Catalog::parse(CATALOG.as_bytes(), &SourceLocation::File("plugins.json".into())).unwrap()
    }

    fn installed(id: &str, version: &str) -> InstalledPlugin {
        InstalledPlugin {
            id: id.into(),
            version: version.into(),
            installed_at: Utc::now(),
            path: PathBuf::from("/plugins").join(id),
            files: vec![PathBuf::from("plugin.py")],
        }
    }

    #[test]
    fn test_reconcile_statuses() {
        let local = vec![
            installed("file_manager", "1.0.0"),
            installed("text_processor", "1.0.0"),
            installed("system_tools", "0.9.0"),
        ];
        let host = Version::new(2, 0, 0);
        let rows = reconcile(&catalog(), &local, Some(&host));

        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["text_processor", "file_manager", "image_watermark", "system_tools"]);
        assert_eq!(rows[0].status, RowStatus::Installed);
        assert_eq!(
            rows[1].status,
            RowStatus::UpdateAvailable {
                installed: "1.0.0".into()
            }
        );
        assert_eq!(rows[2].status, RowStatus::NotInstalled);
        assert!(rows[2].incompatible);
        assert_eq!(rows[3].status, RowStatus::LocalOnly);
        assert_eq!(rows[3].version, "0.9.0");
    }

    #[test]
    fn test_reconcile_is_pure() {
        let local = vec![installed("text_processor", "1.0.0")];
        assert_eq!(reconcile(&catalog(), &local, None), reconcile(&catalog(), &local, None));
    }

    #[test]
    fn test_filter() {
        let rows = reconcile(&catalog(), &[], None);
        assert_eq!(RowFilter::new().search("BULK").apply(&rows).len(), 1);
        assert_eq!(RowFilter::new().category("Text").apply(&rows)[0].id, "text_processor");
        assert_eq!(RowFilter::new().search("  ").apply(&rows).len(), 3);
        assert!(RowFilter::new().search("text").category("Files").apply(&rows).is_empty());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(15360), "15 KB");
        assert_eq!(format_size(1), "1 KB");
        assert_eq!(format_size(2621440), "2.5 MB");
    }
}
