//! Installation store: the on-disk ledger of installed plugins.
//!
//! Layout under the plugins directory:
//!
//! ```text
//! <root>/<id>/                  plugin files
//! <root>/.ledger/<id>.json      ledger record
//! <root>/.ledger/<id>.pending   finalize journal (present only mid-finalize)
//! <root>/.trash/<id>/           previous content moved aside during a swap
//! ```
//!
//! Every mutation of the installation directory goes through [`InstallationStore::record`]
//! or [`InstallationStore::forget`]. Both keep the previous content moved aside until
//! the new state is complete and roll back on failure, and [`InstallationStore::recover`]
//! repairs whatever a crash left behind, so files and ledger never disagree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use walkdir::WalkDir;

use crate::error::{HostError, Result};
use crate::installed::InstalledPlugin;

const LEDGER_DIR: &str = ".ledger";
const TRASH_DIR: &str = ".trash";
const RECORD_EXT: &str = "json";
const PENDING_EXT: &str = "pending";

/// Steps of the finalize and forget critical sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultPoint {
    MoveAside,
    MoveIntoPlace,
    WriteLedger,
    ForgetMoveAside,
    ForgetLedger,
}

/// What [`InstallationStore::recover`] repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Interrupted finalizes whose ledger was already written
    pub rolled_forward: Vec<String>,
    /// Interrupted finalizes undone
    pub rolled_back: Vec<String>,
    /// Moved-aside content put back (interrupted uninstall)
    pub restored: Vec<String>,
    /// Ledger records dropped because their files were gone
    pub dropped_records: Vec<String>,
    /// Unrecorded directories removed
    pub removed_orphans: Vec<String>,
}

impl RecoveryReport {
    /// True when nothing needed repair.
    pub fn is_clean(&self) -> bool {
        self.rolled_forward.is_empty()
            && self.rolled_back.is_empty()
            && self.restored.is_empty()
            && self.dropped_records.is_empty()
            && self.removed_orphans.is_empty()
    }
}

/// Ledger-backed store of installed plugins.
pub struct InstallationStore {
    root: PathBuf,
    /// Staging directory kept out of orphan cleanup when it sits under `root`
    staging: Option<PathBuf>,
    #[cfg(test)]
    fault: std::sync::Mutex<Option<FaultPoint>>,
}

impl InstallationStore {
    /// Open the store at `root`, creating it if needed and repairing any
    /// state left by an interrupted operation.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_staging(root, None)
    }

    /// Like [`open`](Self::open), leaving `staging` alone during recovery.
    pub fn open_with_staging(root: impl Into<PathBuf>, staging: Option<PathBuf>) -> Result<Self> {
        let store = Self {
            root: root.into(),
            staging,
            #[cfg(test)]
            fault: std::sync::Mutex::new(None),
        };
        fs::create_dir_all(store.ledger_dir())?;
        fs::create_dir_all(store.trash_dir())?;

        let report = store.recover()?;
        if !report.is_clean() {
            tracing::warn!("Installation store recovered: {:?}", report);
        }
        Ok(store)
    }

    /// The plugins directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Installation directory for `id`.
    pub fn plugin_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn ledger_dir(&self) -> PathBuf {
        self.root.join(LEDGER_DIR)
    }

    fn trash_dir(&self) -> PathBuf {
        self.root.join(TRASH_DIR)
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.ledger_dir().join(format!("{}.{}", id, RECORD_EXT))
    }

    fn pending_path(&self, id: &str) -> PathBuf {
        self.ledger_dir().join(format!("{}.{}", id, PENDING_EXT))
    }

    fn aside_dir(&self, id: &str) -> PathBuf {
        self.trash_dir().join(id)
    }

    // === Queries ===

    /// All installed plugins, sorted by identifier.
    pub fn list(&self) -> Result<Vec<InstalledPlugin>> {
        let mut installed = Vec::new();
        for id in self.ledger_ids(RECORD_EXT)? {
            if let Some(plugin) = self.get(&id)? {
                installed.push(plugin);
            }
        }
        installed.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(installed)
    }

    /// The installed record for `id`, if its files are present.
    pub fn get(&self, id: &str) -> Result<Option<InstalledPlugin>> {
        validate_id(id)?;
        let Some(plugin) = read_json::<InstalledPlugin>(&self.record_path(id))? else {
            return Ok(None);
        };
        if !plugin.path.is_dir() {
            tracing::warn!("Ledger record for {} has no files at {:?}", id, plugin.path);
            return Ok(None);
        }
        Ok(Some(plugin))
    }

    /// Check whether `id` is installed.
    pub fn is_installed(&self, id: &str) -> bool {
        matches!(self.get(id), Ok(Some(_)))
    }

    // === Mutations ===

    /// Make the content of `staged` the installed version of `id`.
    ///
    /// `staged` must be on the same filesystem as the plugins directory. Any
    /// previous content for `id` is moved aside and only deleted once the new
    /// content and its ledger record are in place; on failure the previous
    /// content is restored and [`HostError::FinalizeConflict`] is returned.
    pub fn record(&self, id: &str, version: &str, staged: &Path) -> Result<InstalledPlugin> {
        validate_id(id)?;
        let dest = self.plugin_dir(id);
        let aside = self.aside_dir(id);

        let entry = InstalledPlugin {
            id: id.to_string(),
            version: version.to_string(),
            installed_at: Utc::now(),
            path: dest.clone(),
            files: collect_files(staged)?,
        };

        if aside.exists() {
            fs::remove_dir_all(&aside)?;
        }
        write_json_atomic(&self.pending_path(id), &entry)?;

        let had_previous = dest.exists();
        if had_previous {
            if let Err(e) = self
                .inject(FaultPoint::MoveAside)
                .and_then(|_| fs::rename(&dest, &aside))
            {
                self.clear_pending(id);
                return Err(HostError::finalize(id, format!("cannot move previous install aside: {}", e)));
            }
        }

        if let Err(e) = self
            .inject(FaultPoint::MoveIntoPlace)
            .and_then(|_| fs::rename(staged, &dest))
        {
            self.rollback_record(id, had_previous, false)?;
            return Err(HostError::finalize(id, format!("cannot move plugin into place: {}", e)));
        }

        if let Err(e) = self
            .inject(FaultPoint::WriteLedger)
            .and_then(|_| write_json_atomic(&self.record_path(id), &entry))
        {
            self.rollback_record(id, had_previous, true)?;
            return Err(HostError::finalize(id, format!("cannot write ledger record: {}", e)));
        }

        self.clear_pending(id);
        if had_previous {
            if let Err(e) = fs::remove_dir_all(&aside) {
                tracing::warn!("Could not delete previous content of {}: {}", id, e);
            }
        }

        tracing::info!("Recorded {} v{} ({} files)", id, version, entry.files.len());
        Ok(entry)
    }

    fn rollback_record(&self, id: &str, had_previous: bool, moved_in: bool) -> Result<()> {
        let dest = self.plugin_dir(id);
        if moved_in {
            fs::remove_dir_all(&dest)
                .map_err(|e| HostError::Ledger(format!("rollback of {} failed: {}", id, e)))?;
        }
        if had_previous {
            fs::rename(self.aside_dir(id), &dest)
                .map_err(|e| HostError::Ledger(format!("restore of {} failed: {}", id, e)))?;
        }
        self.clear_pending(id);
        tracing::warn!("Rolled back finalize of {}", id);
        Ok(())
    }

    fn clear_pending(&self, id: &str) {
        if let Err(e) = fs::remove_file(self.pending_path(id)) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("Could not remove finalize journal for {}: {}", id, e);
            }
        }
    }

    /// Remove `id`'s files and ledger record.
    ///
    /// Fails with [`HostError::NotInstalled`] without touching the disk when
    /// `id` has no record.
    pub fn forget(&self, id: &str) -> Result<InstalledPlugin> {
        let entry = self
            .get(id)?
            .ok_or_else(|| HostError::NotInstalled(id.to_string()))?;
        let dest = self.plugin_dir(id);
        let aside = self.aside_dir(id);

        if aside.exists() {
            fs::remove_dir_all(&aside)?;
        }

        if let Err(e) = self
            .inject(FaultPoint::ForgetMoveAside)
            .and_then(|_| fs::rename(&dest, &aside))
        {
            return Err(HostError::finalize(id, format!("cannot move plugin aside: {}", e)));
        }

        if let Err(e) = self
            .inject(FaultPoint::ForgetLedger)
            .and_then(|_| fs::remove_file(self.record_path(id)))
        {
            fs::rename(&aside, &dest)
                .map_err(|re| HostError::Ledger(format!("restore of {} failed: {}", id, re)))?;
            return Err(HostError::finalize(id, format!("cannot remove ledger record: {}", e)));
        }

        if let Err(e) = fs::remove_dir_all(&aside) {
            tracing::warn!("Could not delete files of {}: {}", id, e);
        }

        tracing::info!("Forgot {} v{}", id, entry.version);
        Ok(entry)
    }

    // === Recovery ===

    /// Bring files and ledger back into agreement after a crash.
    ///
    /// Must not run concurrently with [`record`](Self::record) or
    /// [`forget`](Self::forget); [`open`](Self::open) calls it before the
    /// store is handed out.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        // Interrupted finalizes: forward only if the ledger already holds the
        // journaled record, otherwise back.
        for id in self.ledger_ids(PENDING_EXT)? {
            let pending = read_json::<InstalledPlugin>(&self.pending_path(&id)).ok().flatten();
            let recorded = read_json::<InstalledPlugin>(&self.record_path(&id)).ok().flatten();
            let dest = self.plugin_dir(&id);
            let aside = self.aside_dir(&id);

            if pending.is_some() && pending == recorded && dest.is_dir() {
                if aside.exists() {
                    fs::remove_dir_all(&aside)?;
                }
                report.rolled_forward.push(id.clone());
            } else {
                if aside.exists() {
                    if dest.exists() {
                        fs::remove_dir_all(&dest)?;
                    }
                    fs::rename(&aside, &dest)?;
                } else if recorded.is_none() && dest.exists() {
                    fs::remove_dir_all(&dest)?;
                }
                report.rolled_back.push(id.clone());
            }
            self.clear_pending(&id);
        }

        // Leftover moved-aside content
        for entry in fs::read_dir(self.trash_dir())? {
            let entry = entry?;
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let dest = self.plugin_dir(&id);
            if !dest.exists() && self.record_path(&id).exists() {
                fs::rename(entry.path(), &dest)?;
                report.restored.push(id);
            } else {
                remove_path(&entry.path())?;
            }
        }

        // Records without files
        for id in self.ledger_ids(RECORD_EXT)? {
            let recorded = read_json::<InstalledPlugin>(&self.record_path(&id)).ok().flatten();
            let intact = recorded.is_some_and(|p| p.path.is_dir());
            if !intact {
                fs::remove_file(self.record_path(&id))?;
                report.dropped_records.push(id);
            }
        }

        // Files without records
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') || self.record_path(name).exists() {
                continue;
            }
            if self.staging.as_deref() == Some(entry.path().as_path()) {
                continue;
            }
            tracing::warn!("Removing unrecorded plugin content: {:?}", entry.path());
            remove_path(&entry.path())?;
            report.removed_orphans.push(name.to_string());
        }

        // Half-written ledger records
        for entry in fs::read_dir(self.ledger_dir())? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "tmp") {
                fs::remove_file(&path)?;
            }
        }

        Ok(report)
    }

    fn ledger_ids(&self, ext: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(self.ledger_dir())? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ext) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    // === Fault injection ===

    #[cfg(test)]
    pub(crate) fn inject_fault(&self, point: FaultPoint) {
        *self.fault.lock().unwrap() = Some(point);
    }

    #[cfg(test)]
    fn inject(&self, point: FaultPoint) -> io::Result<()> {
        let mut fault = self.fault.lock().unwrap();
        if *fault == Some(point) {
            *fault = None;
            return Err(io::Error::other(format!("injected fault at {:?}", point)));
        }
        Ok(())
    }

    #[cfg(not(test))]
    #[inline]
    fn inject(&self, _point: FaultPoint) -> io::Result<()> {
        Ok(())
    }
}

/// Whether `id` can name a directory directly under the plugins root.
pub(crate) fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && !id.starts_with('.') && !id.contains(['/', '\\']) && !id.contains("..")
}

fn validate_id(id: &str) -> Result<()> {
    if !is_valid_id(id) {
        return Err(HostError::Ledger(format!("invalid plugin identifier: {:?}", id)));
    }
    Ok(())
}

/// Regular files under `dir`, relative to it, sorted.
fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| HostError::Io(io::Error::other(e.to_string())))?;
        if entry.file_type().is_file() {
            if let Ok(rel) = entry.path().strip_prefix(dir) {
                files.push(rel.to_path_buf());
            }
        }
    }
    Ok(files)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| HostError::Ledger(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write via a temp file and rename so readers see old or new, never half.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    let tmp = path.with_extension("tmp");
    {
        use std::io::Write;
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

fn remove_path(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}
