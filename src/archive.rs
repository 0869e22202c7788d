//! Plugin archive verification and extraction.
//!
//! Archives are sniffed by content, not by name: zip (the catalog's native
//! format), gzip-compressed tar, and plain tar are accepted. Entry paths are
//! sanitized so nothing can be written outside the extraction directory.

use std::fs::{self, File};
use std::io::{self, Read, Seek};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tar::Archive;
use thiserror::Error;
use zip::ZipArchive;

use crate::transfer::CancelFlag;

/// Archive problems found while verifying or extracting.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("unrecognized archive format")]
    Unsupported,

    #[error("corrupt archive: {0}")]
    Corrupt(String),

    #[error("archive entry escapes destination: {}", .0.display())]
    UnsafePath(PathBuf),

    #[error("archive is empty")]
    Empty,

    #[error("size mismatch: declared {declared} bytes, got {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Container format of a staged archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    Tar,
}

/// What a verified archive must match.
#[derive(Debug, Clone, Default)]
pub struct Expectations {
    pub declared_size: Option<u64>,
    /// Allowed relative deviation from `declared_size`
    pub size_tolerance: f64,
    /// Lowercase hex SHA-256
    pub sha256: Option<String>,
}

/// Detect the archive format from the first bytes of the file.
pub fn detect_kind(path: &Path) -> Result<ArchiveKind, ArchiveError> {
    let mut header = [0u8; 512];
    let mut file = File::open(path)?;
    let mut read = 0;
    while read < header.len() {
        let n = file.read(&mut header[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    let header = &header[..read];

    if header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06") {
        Ok(ArchiveKind::Zip)
    } else if header.starts_with(&[0x1f, 0x8b]) {
        Ok(ArchiveKind::TarGz)
    } else if header.len() >= 262 && &header[257..262] == b"ustar" {
        Ok(ArchiveKind::Tar)
    } else {
        Err(ArchiveError::Unsupported)
    }
}

/// Check size, checksum and structure of a staged archive.
pub fn verify(path: &Path, expect: &Expectations) -> Result<ArchiveKind, ArchiveError> {
    let actual = fs::metadata(path)?.len();
    if let Some(declared) = expect.declared_size.filter(|d| *d > 0) {
        let allowed = (declared as f64 * expect.size_tolerance).ceil() as u64;
        if actual.abs_diff(declared) > allowed {
            return Err(ArchiveError::SizeMismatch { declared, actual });
        }
    }

    if let Some(expected) = &expect.sha256 {
        let mut hasher = Sha256::new();
        io::copy(&mut File::open(path)?, &mut hasher)?;
        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(ArchiveError::ChecksumMismatch {
                expected: expected.clone(),
                actual,
            });
        }
    }

    let kind = detect_kind(path)?;
    let entries = match kind {
        ArchiveKind::Zip => ZipArchive::new(File::open(path)?)
            .map_err(|e| ArchiveError::Corrupt(e.to_string()))?
            .len(),
        ArchiveKind::TarGz => count_tar_entries(GzDecoder::new(File::open(path)?))?,
        ArchiveKind::Tar => count_tar_entries(File::open(path)?)?,
    };
    if entries == 0 {
        return Err(ArchiveError::Empty);
    }
    Ok(kind)
}

fn count_tar_entries<R: Read>(reader: R) -> Result<usize, ArchiveError> {
    let mut archive = Archive::new(reader);
    let mut count = 0;
    for entry in archive.entries().map_err(|e| ArchiveError::Corrupt(e.to_string()))? {
        let mut entry = entry.map_err(|e| ArchiveError::Corrupt(e.to_string()))?;
        // Reading the body is what surfaces truncation in the compressed stream
        io::copy(&mut entry, &mut io::sink()).map_err(|e| ArchiveError::Corrupt(e.to_string()))?;
        count += 1;
    }
    Ok(count)
}

/// Extract `archive_path` into `dest_dir`, checking `cancel` between entries.
pub fn extract(
    archive_path: &Path,
    kind: ArchiveKind,
    dest_dir: &Path,
    cancel: &CancelFlag,
) -> Result<(), ArchiveError> {
    fs::create_dir_all(dest_dir)?;
    match kind {
        ArchiveKind::Zip => extract_zip(File::open(archive_path)?, dest_dir, cancel),
        ArchiveKind::TarGz => extract_tar(GzDecoder::new(File::open(archive_path)?), dest_dir, cancel),
        ArchiveKind::Tar => extract_tar(File::open(archive_path)?, dest_dir, cancel),
    }
}

fn extract_zip<R: Read + Seek>(reader: R, dest_dir: &Path, cancel: &CancelFlag) -> Result<(), ArchiveError> {
    let mut archive = ZipArchive::new(reader).map_err(|e| ArchiveError::Corrupt(e.to_string()))?;
    for i in 0..archive.len() {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let mut entry = archive
            .by_index(i)
            .map_err(|e| ArchiveError::Corrupt(e.to_string()))?;
        let raw = entry.name().replace('\\', "/");
        let rel = sanitize_entry_path(Path::new(&raw))?;
        let out = dest_dir.join(&rel);
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out_file = File::create(&out)?;
        io::copy(&mut entry, &mut out_file).map_err(|e| ArchiveError::Corrupt(e.to_string()))?;
    }
    Ok(())
}

fn extract_tar<R: Read>(reader: R, dest_dir: &Path, cancel: &CancelFlag) -> Result<(), ArchiveError> {
    let mut archive = Archive::new(reader);
    for entry in archive.entries().map_err(|e| ArchiveError::Corrupt(e.to_string()))? {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let mut entry = entry.map_err(|e| ArchiveError::Corrupt(e.to_string()))?;
        let entry_type = entry.header().entry_type();
        let raw = entry
            .path()
            .map_err(|e| ArchiveError::Corrupt(e.to_string()))?
            .to_path_buf();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            return Err(ArchiveError::UnsafePath(raw));
        }
        let rel = sanitize_entry_path(&raw)?;
        let out = dest_dir.join(&rel);
        if entry_type.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&out)
            .map_err(|e| ArchiveError::Corrupt(format!("{}: {}", out.display(), e)))?;
    }
    Ok(())
}

/// Reject absolute paths and `..`; drop `.` components.
fn sanitize_entry_path(path: &Path) -> Result<PathBuf, ArchiveError> {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => {
                return Err(ArchiveError::UnsafePath(path.to_path_buf()));
            }
            Component::CurDir => {}
            Component::Normal(part) => cleaned.push(part),
        }
    }
    if cleaned.as_os_str().is_empty() {
        return Err(ArchiveError::UnsafePath(path.to_path_buf()));
    }
    Ok(cleaned)
}

/// The directory whose contents become the installation.
///
/// An archive that wraps everything in a single top-level directory is
/// unwrapped; otherwise the extraction directory itself is the root.
pub fn content_root(extract_dir: &Path) -> Result<PathBuf, ArchiveError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(extract_dir)? {
        entries.push(entry?);
    }
    match entries.as_slice() {
        [] => Err(ArchiveError::Empty),
        [only] if only.file_type()?.is_dir() => Ok(only.path()),
        _ => Ok(extract_dir.to_path_buf()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// Build a zip archive with the given `(path, content)` entries.
    pub(crate) fn zip_bytes(files: &[(&str, &str)]) -> Vec<u8> {
        let mut cursor = io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            for (path, content) in files {
                writer.start_file(*path, options).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    fn tar_gz_bytes(files: &[(&str, &str)]) -> Vec<u8> {
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn write(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_detect_and_verify_zip() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = zip_bytes(&[("plugin1.py", "print('hi')")]);
        let path = write(dir.path(), "a.bin", &bytes);

        let expect = Expectations {
            declared_size: Some(bytes.len() as u64),
            size_tolerance: 0.0,
            sha256: Some(hex::encode(Sha256::digest(&bytes))),
        };
        assert_eq!(verify(&path, &expect).unwrap(), ArchiveKind::Zip);
    }

    #[test]
    fn test_size_tolerance() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = zip_bytes(&[("a.py", "a")]);
        let path = write(dir.path(), "a.zip", &bytes);
        let declared = bytes.len() as u64 + 2;

        let strict = Expectations {
            declared_size: Some(declared),
            ..Default::default()
        };
        assert!(matches!(
            verify(&path, &strict),
            Err(ArchiveError::SizeMismatch { .. })
        ));

        let loose = Expectations {
            declared_size: Some(declared),
            size_tolerance: 0.5,
            sha256: None,
        };
        assert!(verify(&path, &loose).is_ok());
    }

    #[test]
    fn test_checksum_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "a.zip", &zip_bytes(&[("a.py", "a")]));
        let expect = Expectations {
            sha256: Some("00".repeat(32)),
            ..Default::default()
        };
        assert!(matches!(
            verify(&path, &expect),
            Err(ArchiveError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_garbage_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "a.zip", b"<html>not found</html>");
        assert!(matches!(
            verify(&path, &Expectations::default()),
            Err(ArchiveError::Unsupported)
        ));

        let bytes = zip_bytes(&[("a.py", "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")]);
        let path = write(dir.path(), "b.zip", &bytes[..bytes.len() / 2]);
        assert!(matches!(
            verify(&path, &Expectations::default()),
            Err(ArchiveError::Corrupt(_))
        ));
    }

    #[test]
    fn test_extract_tar_gz_and_unwrap_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "p.tar.gz",
            &tar_gz_bytes(&[("tool/main.py", "m"), ("tool/lib/util.py", "u")]),
        );
        let kind = verify(&path, &Expectations::default()).unwrap();
        assert_eq!(kind, ArchiveKind::TarGz);

        let out = dir.path().join("out");
        extract(&path, kind, &out, &CancelFlag::new()).unwrap();
        let root = content_root(&out).unwrap();
        assert_eq!(root, out.join("tool"));
        assert!(root.join("lib/util.py").exists());
    }

    #[test]
    fn test_extract_flat_zip_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "p.zip", &zip_bytes(&[("plugin1.py", "x"), ("README", "r")]));
        let out = dir.path().join("out");
        extract(&path, ArchiveKind::Zip, &out, &CancelFlag::new()).unwrap();
        assert_eq!(content_root(&out).unwrap(), out);
    }

    #[test]
    fn test_rejects_escaping_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "evil.zip", &zip_bytes(&[("../evil.py", "x")]));
        let out = dir.path().join("out");
        let err = extract(&path, ArchiveKind::Zip, &out, &CancelFlag::new()).unwrap_err();
        assert!(matches!(err, ArchiveError::UnsafePath(_)));
        assert!(!dir.path().join("evil.py").exists());
    }

    #[test]
    fn test_extract_honors_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "p.zip", &zip_bytes(&[("a.py", "a")]));
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = extract(&path, ArchiveKind::Zip, &dir.path().join("out"), &cancel).unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled));
    }
}
