//! Verified, timestamped backups of shared files

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A backup copy of a shared file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backup {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Write `contents` as a new backup of `source_name` inside `dir`.
///
/// The copy is synced and read back; its SHA-256 must match the source bytes
/// before the path is returned. Names never collide, so concurrent backups of
/// the same file each get their own copy.
pub fn write_verified(dir: &Path, source_name: &str, contents: &[u8]) -> io::Result<Backup> {
    std::fs::create_dir_all(dir)?;

    let created_at = Utc::now();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let name = format!(
        "{}.{}.{}.bak",
        source_name,
        created_at.format("%Y%m%dT%H%M%S%.6f"),
        &suffix[..8]
    );
    let path = dir.join(name);

    let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    let written = std::fs::read(&path)?;
    let expected = hex::encode(Sha256::digest(contents));
    let actual = hex::encode(Sha256::digest(&written));
    if expected != actual {
        let _ = std::fs::remove_file(&path);
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "backup checksum mismatch for {}: expected {}, got {}",
                path.display(),
                expected,
                actual
            ),
        ));
    }

    debug!(path = %path.display(), sha256 = %actual, "Backup written");
    Ok(Backup { path, created_at })
}

/// List backups of `source_name` in `dir`, newest first
pub fn list(dir: &Path, source_name: &str) -> io::Result<Vec<Backup>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let prefix = format!("{}.", source_name);
    let mut backups = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(&prefix) || !name.ends_with(".bak") {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        backups.push(Backup {
            path: entry.path(),
            created_at: DateTime::<Utc>::from(modified),
        });
    }

    // Names embed the creation timestamp, so they break ties on coarse mtimes
    backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.path.cmp(&a.path)));
    Ok(backups)
}

/// Resolve a caller-supplied backup path, accepting only existing files inside `dir`
pub fn resolve(dir: &Path, requested: &Path) -> Option<PathBuf> {
    let candidate = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        dir.join(requested)
    };

    let dir = dir.canonicalize().ok()?;
    let candidate = candidate.canonicalize().ok()?;
    if candidate.parent() == Some(dir.as_path()) && candidate.is_file() {
        Some(candidate)
    } else {
        None
    }
}
