//! Backup sessions for files removed during configuration cleanup.
//!
//! Layout under the backup root:
//!
//! ```text
//! <root>/
//!   .lock                         # held while a session is written
//!   20260301T101500Z/
//!     manifest.json
//!     etc/modprobe.d/nvidia.conf  # original path, leading '/' stripped
//! ```
//!
//! The manifest records the SHA-256 of every copy; restores are verified
//! against it.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use time::OffsetDateTime;
use tracing::debug;

pub const MANIFEST_FILENAME: &str = "manifest.json";
const LOCK_FILENAME: &str = ".lock";

/// One backed-up file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub original: PathBuf,
    pub backup: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub created_at_utc: String,
    pub entries: Vec<BackupEntry>,
}

/// An open backup session. Holds the root lock until [`BackupSession::finish`]
/// or drop.
#[derive(Debug)]
pub struct BackupSession {
    dir: PathBuf,
    created_at_utc: String,
    entries: Vec<BackupEntry>,
    _lock: RootLock,
}

impl BackupSession {
    /// Lock `root` and create a fresh timestamped session directory in it.
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("creating backup root '{}'", root.display()))?;
        let lock = RootLock::acquire(root)?;

        let created_at_utc = now_utc_compact();
        let mut dir = root.join(&created_at_utc);
        let mut suffix = 1;
        while dir.exists() {
            dir = root.join(format!("{}-{}", created_at_utc, suffix));
            suffix += 1;
        }
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating backup session '{}'", dir.display()))?;
        debug!(session = %dir.display(), "backup session created");

        Ok(Self {
            dir,
            created_at_utc,
            entries: Vec::new(),
            _lock: lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entries(&self) -> &[BackupEntry] {
        &self.entries
    }

    /// Copy `original` into the session, preserving its path layout.
    pub fn add(&mut self, original: &Path) -> Result<BackupEntry> {
        let backup = self.dir.join(relative_layout(original)?);
        if let Some(parent) = backup.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }
        fs::copy(original, &backup).with_context(|| {
            format!(
                "backing up '{}' to '{}'",
                original.display(),
                backup.display()
            )
        })?;
        let entry = BackupEntry {
            original: original.to_path_buf(),
            sha256: sha256_file(&backup)?,
            backup,
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    /// Write the manifest and release the lock.
    pub fn finish(self) -> Result<PathBuf> {
        let manifest = BackupManifest {
            created_at_utc: self.created_at_utc,
            entries: self.entries,
        };
        let path = self.dir.join(MANIFEST_FILENAME);
        let bytes = serde_json::to_vec_pretty(&manifest)?;
        fs::write(&path, bytes)
            .with_context(|| format!("writing backup manifest '{}'", path.display()))?;
        Ok(self.dir)
    }
}

pub fn load_manifest(session_dir: &Path) -> Result<BackupManifest> {
    let path = session_dir.join(MANIFEST_FILENAME);
    let bytes =
        fs::read(&path).with_context(|| format!("reading backup manifest '{}'", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing backup manifest '{}'", path.display()))
}

/// Read a backup's bytes, verified against the manifest digest.
///
/// Writing them back to [`BackupEntry::original`] is left to the caller,
/// which usually needs elevation for it.
pub fn read_verified(entry: &BackupEntry) -> Result<Vec<u8>> {
    let bytes = fs::read(&entry.backup)
        .with_context(|| format!("reading backup '{}'", entry.backup.display()))?;
    let actual = sha256_bytes(&bytes);
    if actual != entry.sha256 {
        bail!(
            "backup of '{}' does not match manifest digest (expected {}, got {})",
            entry.original.display(),
            entry.sha256,
            actual
        );
    }
    Ok(bytes)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r
            .read(&mut buf)
            .with_context(|| format!("reading '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// `/etc/modprobe.d/nvidia.conf` -> `etc/modprobe.d/nvidia.conf`.
fn relative_layout(original: &Path) -> Result<PathBuf> {
    let mut rel = PathBuf::new();
    for component in original.components() {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                bail!("refusing to back up '{}'", original.display())
            }
        }
    }
    if rel.as_os_str().is_empty() {
        bail!("refusing to back up '{}'", original.display());
    }
    Ok(rel)
}

pub(crate) fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

/// Exclusive lock on the backup root. Unlocks and removes the file on drop.
#[derive(Debug)]
struct RootLock {
    file: File,
    path: PathBuf,
}

impl RootLock {
    fn acquire(root: &Path) -> Result<Self> {
        let path = root.join(LOCK_FILENAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("creating lock file '{}'", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            bail!("backup directory is locked by another process: {}", path.display());
        }
        Ok(Self { file, path })
    }
}

impl Drop for RootLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_backup_session_round_trip() {
        let temp = TempDir::new().unwrap();
        let original = temp.path().join("etc/modprobe.d/nvidia.conf");
        fs::create_dir_all(original.parent().unwrap()).unwrap();
        fs::write(&original, "options nvidia NVreg_PreserveVideoMemoryAllocations=1\n").unwrap();

        let mut session = BackupSession::create(&temp.path().join("backups")).unwrap();
        let entry = session.add(&original).unwrap();
        assert!(entry.backup.starts_with(session.dir()));
        assert!(entry.backup.ends_with("etc/modprobe.d/nvidia.conf"));
        let dir = session.finish().unwrap();

        let manifest = load_manifest(&dir).unwrap();
        assert_eq!(manifest.entries, vec![entry.clone()]);

        let bytes = read_verified(&entry).unwrap();
        assert_eq!(bytes, b"options nvidia NVreg_PreserveVideoMemoryAllocations=1\n");
        assert_eq!(sha256_bytes(&bytes), entry.sha256);
    }

    #[test]
    fn test_read_verified_detects_tampered_backup() {
        let temp = TempDir::new().unwrap();
        let original = temp.path().join("xorg.conf");
        fs::write(&original, "Section \"Device\"\n").unwrap();

        let mut session = BackupSession::create(temp.path()).unwrap();
        let entry = session.add(&original).unwrap();
        session.finish().unwrap();

        fs::write(&entry.backup, "tampered").unwrap();
        let err = read_verified(&entry).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_root_is_locked_during_session() {
        let temp = TempDir::new().unwrap();
        let first = BackupSession::create(temp.path()).unwrap();
        assert!(BackupSession::create(temp.path()).is_err());
        first.finish().unwrap();
        let second = BackupSession::create(temp.path()).unwrap();
        assert_ne!(second.dir(), temp.path());
    }

    #[test]
    fn test_relative_layout_rejects_traversal() {
        assert_eq!(
            relative_layout(Path::new("/etc/X11/xorg.conf")).unwrap(),
            PathBuf::from("etc/X11/xorg.conf")
        );
        assert!(relative_layout(Path::new("/etc/../shadow")).is_err());
        assert!(relative_layout(Path::new("/")).is_err());
    }
}
