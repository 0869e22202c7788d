//! Transfer and unpack engine.
//!
//! An install runs in two phases. [`TransferEngine::prepare`] downloads the
//! archive into a private staging directory, verifies it and unpacks it; it
//! is cancellable and touches nothing outside staging. [`TransferEngine::finalize`]
//! hands the unpacked content to the [`InstallationStore`] for the atomic
//! swap and cannot be cancelled. Staging directories are removed on drop,
//! so every failure path leaves no partial files behind.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::archive::{self, ArchiveError, ArchiveKind, Expectations};
use crate::catalog::{PluginDescriptor, SourceLocation};
use crate::error::{HostError, Result};
use crate::installed::InstalledPlugin;
use crate::store::InstallationStore;

/// Emit a progress event at most once per this many bytes.
const PROGRESS_STEP: u64 = 64 * 1024;

const READ_CHUNK: usize = 64 * 1024;

/// Cooperative cancellation flag, checked between download chunks and
/// between unpack steps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Download progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes written to staging so far
    pub transferred: u64,
    /// Total bytes, when the source reports it
    pub total: Option<u64>,
}

impl Progress {
    /// Progress 0.0 to 1.0, if the total is known.
    pub fn fraction(&self) -> Option<f32> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some((self.transferred as f64 / total as f64).min(1.0) as f32),
        }
    }
}

/// A downloaded, verified and unpacked plugin waiting in staging.
#[derive(Debug)]
pub struct StagedPlugin {
    id: String,
    version: String,
    kind: ArchiveKind,
    content_root: PathBuf,
    // Dropping removes everything still in staging
    workdir: TempDir,
}

impl StagedPlugin {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn kind(&self) -> ArchiveKind {
        self.kind
    }

    /// Directory whose contents become `<plugins_dir>/<id>/`.
    pub fn content_root(&self) -> &Path {
        &self.content_root
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }
}

/// Downloads, verifies and unpacks plugin archives.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    staging_dir: PathBuf,
    http: reqwest::Client,
    size_tolerance: f64,
}

impl TransferEngine {
    /// Create an engine staging under `staging_dir`.
    ///
    /// `staging_dir` must be on the same filesystem as the plugins
    /// directory so finalize is a rename.
    pub fn new(staging_dir: PathBuf, timeout: Duration, size_tolerance: f64) -> Result<Self> {
        std::fs::create_dir_all(&staging_dir)?;
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|e| HostError::transfer("*", e))?;
        Ok(Self {
            staging_dir,
            http,
            size_tolerance,
        })
    }

    /// The staging directory.
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Remove staging leftovers from a previous run.
    pub fn clear_staging(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.staging_dir)? {
            let path = entry?.path();
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(e) = removed {
                tracing::warn!("Could not clear staging entry {:?}: {}", path, e);
            }
        }
        Ok(())
    }

    /// Download, verify and unpack `descriptor` into staging.
    pub async fn prepare<F>(
        &self,
        descriptor: &PluginDescriptor,
        cancel: &CancelFlag,
        mut progress: F,
    ) -> Result<StagedPlugin>
    where
        F: FnMut(Progress) + Send,
    {
        let id = descriptor.id.as_str();
        let workdir = tempfile::Builder::new()
            .prefix(&format!("{}-", id))
            .tempdir_in(&self.staging_dir)
            .map_err(|e| HostError::transfer(id, format!("cannot create staging directory: {}", e)))?;
        let archive_path = workdir.path().join("archive");

        tracing::info!("Downloading {} v{} from {}", id, descriptor.version, descriptor.source);
        self.download(descriptor, &archive_path, cancel, &mut progress).await?;
        if cancel.is_cancelled() {
            return Err(HostError::Cancelled(id.to_string()));
        }

        let expect = Expectations {
            declared_size: descriptor.file_size,
            size_tolerance: self.size_tolerance,
            sha256: descriptor.sha256.clone(),
        };
        let extract_dir = workdir.path().join("extract");
        let (kind, content_root) = {
            let owned = id.to_string();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                unpack(&owned, &archive_path, &expect, &extract_dir, &cancel)
            })
            .await
            .map_err(|e| HostError::archive(id, format!("unpack worker failed: {}", e)))??
        };

        tracing::debug!("{} staged at {:?} ({:?})", id, content_root, kind);
        Ok(StagedPlugin {
            id: id.to_string(),
            version: descriptor.version.to_string(),
            kind,
            content_root,
            workdir,
        })
    }

    /// Atomically install staged content through the store.
    ///
    /// Not cancellable; either completes or rolls back.
    pub async fn finalize(
        &self,
        staged: StagedPlugin,
        store: &Arc<InstallationStore>,
    ) -> Result<InstalledPlugin> {
        let store = Arc::clone(store);
        let id = staged.id.clone();
        tokio::task::spawn_blocking(move || {
            let result = store.record(&staged.id, &staged.version, &staged.content_root);
            drop(staged);
            result
        })
        .await
        .map_err(|e| HostError::finalize(&id, format!("finalize worker failed: {}", e)))?
    }

    /// Download, verify, unpack and finalize in one call.
    pub async fn install<F>(
        &self,
        descriptor: &PluginDescriptor,
        store: &Arc<InstallationStore>,
        cancel: &CancelFlag,
        progress: F,
    ) -> Result<InstalledPlugin>
    where
        F: FnMut(Progress) + Send,
    {
        let staged = self.prepare(descriptor, cancel, progress).await?;
        self.finalize(staged, store).await
    }

    /// Remove an installed plugin through the store.
    pub async fn uninstall(&self, id: &str, store: &Arc<InstallationStore>) -> Result<InstalledPlugin> {
        let store = Arc::clone(store);
        let owned = id.to_string();
        tokio::task::spawn_blocking(move || store.forget(&owned))
            .await
            .map_err(|e| HostError::finalize(id, format!("uninstall worker failed: {}", e)))?
    }

    async fn download<F>(
        &self,
        descriptor: &PluginDescriptor,
        dest: &Path,
        cancel: &CancelFlag,
        progress: &mut F,
    ) -> Result<()>
    where
        F: FnMut(Progress) + Send,
    {
        let id = descriptor.id.as_str();
        let mut out = tokio::fs::File::create(dest)
            .await
            .map_err(|e| HostError::transfer(id, e))?;
        let mut meter = Meter::default();

        let total = match &descriptor.source {
            SourceLocation::File(path) => {
                let mut src = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| HostError::transfer(id, format!("{}: {}", path.display(), e)))?;
                let total = src.metadata().await.ok().map(|m| m.len());
                let mut buf = vec![0u8; READ_CHUNK];
                loop {
                    if cancel.is_cancelled() {
                        return Err(HostError::Cancelled(id.to_string()));
                    }
                    let n = src.read(&mut buf).await.map_err(|e| HostError::transfer(id, e))?;
                    if n == 0 {
                        break;
                    }
                    out.write_all(&buf[..n])
                        .await
                        .map_err(|e| HostError::transfer(id, e))?;
                    meter.advance(n as u64, total, progress);
                }
                total
            }
            SourceLocation::Http(url) => {
                let mut response = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| HostError::transfer(id, e))?;
                let total = response.content_length();
                loop {
                    if cancel.is_cancelled() {
                        return Err(HostError::Cancelled(id.to_string()));
                    }
                    let Some(chunk) = response.chunk().await.map_err(|e| {
                        HostError::transfer(id, format!("interrupted after {} bytes: {}", meter.transferred, e))
                    })?
                    else {
                        break;
                    };
                    out.write_all(&chunk)
                        .await
                        .map_err(|e| HostError::transfer(id, e))?;
                    meter.advance(chunk.len() as u64, total, progress);
                }
                total
            }
        };

        if let Some(total) = total {
            if meter.transferred < total {
                return Err(HostError::transfer(
                    id,
                    format!("connection closed after {} of {} bytes", meter.transferred, total),
                ));
            }
        }
        out.flush().await.map_err(|e| HostError::transfer(id, e))?;
        out.sync_all().await.map_err(|e| HostError::transfer(id, e))?;
        meter.finish(total, progress);

        tracing::info!("Downloaded {} ({} bytes)", id, meter.transferred);
        Ok(())
    }
}

#[derive(Default)]
struct Meter {
    transferred: u64,
    reported: Option<u64>,
}

impl Meter {
    fn advance<F: FnMut(Progress)>(&mut self, n: u64, total: Option<u64>, progress: &mut F) {
        self.transferred += n;
        let due = match self.reported {
            None => true,
            Some(last) => self.transferred - last >= PROGRESS_STEP,
        };
        if due {
            self.reported = Some(self.transferred);
            progress(Progress {
                transferred: self.transferred,
                total,
            });
        }
    }

    fn finish<F: FnMut(Progress)>(&mut self, total: Option<u64>, progress: &mut F) {
        if self.reported != Some(self.transferred) {
            self.reported = Some(self.transferred);
            progress(Progress {
                transferred: self.transferred,
                total,
            });
        }
    }
}

fn unpack(
    id: &str,
    archive_path: &Path,
    expect: &Expectations,
    extract_dir: &Path,
    cancel: &CancelFlag,
) -> Result<(ArchiveKind, PathBuf)> {
    let to_host = |e: ArchiveError| match e {
        ArchiveError::Cancelled => HostError::Cancelled(id.to_string()),
        other => HostError::archive(id, other),
    };

    let kind = archive::verify(archive_path, expect).map_err(to_host)?;
    if cancel.is_cancelled() {
        return Err(HostError::Cancelled(id.to_string()));
    }
    archive::extract(archive_path, kind, extract_dir, cancel).map_err(to_host)?;
    let root = archive::content_root(extract_dir).map_err(to_host)?;
    Ok((kind, root))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::archive::tests::zip_bytes;
    use crate::catalog::Catalog;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    pub(crate) fn descriptor(id: &str, url: &str, file_size: Option<u64>) -> PluginDescriptor {
        let size = file_size.map(|s| format!(r#", "file_size": {}"#, s)).unwrap_or_default();
        let doc = format!(
            r#"{{"version": "1.0", "plugins": [{{"id": "{}", "version": "1.0.0", "url": "{}"{}}}]}}"#,
            id, url, size
        );
        Catalog::parse(doc.as_bytes(), &SourceLocation::File("/".into()))
            .unwrap()
            .get(id)
            .unwrap()
            .clone()
    }

    /// Serve `body` once over HTTP, advertising `advertised` bytes and
    /// closing after `send` bytes.
    pub(crate) async fn serve_once(body: Vec<u8>, advertised: usize, send: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut req = [0u8; 2048];
            let _ = socket.read(&mut req).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/zip\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                advertised
            );
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(&body[..send.min(body.len())]).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{}/plugin.zip", addr)
    }

    fn engine(dir: &Path) -> TransferEngine {
        TransferEngine::new(dir.join(".staging"), Duration::from_secs(5), 0.05).unwrap()
    }

    fn staging_is_empty(engine: &TransferEngine) -> bool {
        std::fs::read_dir(engine.staging_dir()).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_install_from_local_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let bytes = zip_bytes(&[("plugin1.py", "class TextProcessor: pass")]);
        let archive = tmp.path().join("text_processor.zip");
        std::fs::write(&archive, &bytes).unwrap();

        let store = Arc::new(InstallationStore::open(tmp.path().join("plugins")).unwrap());
        let engine = engine(&tmp.path().join("plugins"));
        let events = Mutex::new(Vec::new());
        let desc = descriptor(
            "text_processor",
            &archive.to_string_lossy(),
            Some(bytes.len() as u64),
        );

        let installed = engine
            .install(&desc, &store, &CancelFlag::new(), |p| events.lock().unwrap().push(p))
            .await
            .unwrap();

        assert_eq!(installed.id, "text_processor");
        assert_eq!(installed.version, "1.0.0");
        assert!(installed.path.join("plugin1.py").exists());
        let events = events.into_inner().unwrap();
        assert_eq!(
            events.last().copied(),
            Some(Progress {
                transferred: bytes.len() as u64,
                total: Some(bytes.len() as u64)
            })
        );
        assert!(staging_is_empty(&engine));
    }

    #[tokio::test]
    async fn test_http_download() {
        let tmp = tempfile::tempdir().unwrap();
        let bytes = zip_bytes(&[("plugin2.py", "x")]);
        let url = serve_once(bytes.clone(), bytes.len(), bytes.len()).await;

        let engine = engine(tmp.path());
        let staged = engine
            .prepare(&descriptor("file_manager", &url, None), &CancelFlag::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(staged.kind(), ArchiveKind::Zip);
        assert!(staged.content_root().join("plugin2.py").exists());

        let workdir = staged.workdir().to_path_buf();
        drop(staged);
        assert!(!workdir.exists());
    }

    #[tokio::test]
    async fn test_interrupted_download_leaves_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let bytes: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let url = serve_once(bytes.clone(), bytes.len(), bytes.len() / 2).await;

        let engine = engine(tmp.path());
        let err = engine
            .prepare(&descriptor("big", &url, None), &CancelFlag::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::TransferFailed { .. }), "{:?}", err);
        assert!(staging_is_empty(&engine));
    }

    #[tokio::test]
    async fn test_invalid_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("broken.zip");
        std::fs::write(&archive, b"this is not an archive").unwrap();

        let engine = engine(tmp.path());
        let err = engine
            .prepare(&descriptor("broken", &archive.to_string_lossy(), None), &CancelFlag::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::ArchiveInvalid { .. }));
        assert!(staging_is_empty(&engine));
    }

    #[tokio::test]
    async fn test_missing_source_is_transfer_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path());
        let missing = tmp.path().join("nope.zip");
        let err = engine
            .prepare(&descriptor("nope", &missing.to_string_lossy(), None), &CancelFlag::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::TransferFailed { .. }));
    }

    #[tokio::test]
    async fn test_cancel_during_download() {
        let tmp = tempfile::tempdir().unwrap();
        let body: Vec<u8> = vec![7u8; 512 * 1024];
        let archive = tmp.path().join("big.zip");
        std::fs::write(&archive, &body).unwrap();

        let engine = engine(tmp.path());
        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        let err = engine
            .prepare(&descriptor("big", &archive.to_string_lossy(), None), &cancel, move |_| {
                trigger.cancel()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::Cancelled(_)));
        assert!(staging_is_empty(&engine));
    }

    #[test]
    fn test_progress_fraction() {
        let p = Progress {
            transferred: 50,
            total: Some(100),
        };
        assert_eq!(p.fraction(), Some(0.5));
        assert_eq!(Progress { transferred: 5, total: None }.fraction(), None);
    }
}
