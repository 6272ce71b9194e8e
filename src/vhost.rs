//! Regeneration of the web server's virtual-host section
//!
//! The managed section sits between two marker lines in a larger config
//! file. Everything outside the markers is preserved byte for byte. Rendering
//! is a pure function of the site list so identical input always yields an
//! identical file.

use crate::backup::{self, Backup};
use crate::config::VhostSettings;
use crate::db::Site;
use crate::error::{Classify, ErrorCode};
use crate::lock::{LockError, LockedFile};
use serde::Serialize;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum VhostError {
    #[error("virtual-host section markers not found in {0}")]
    SectionNotFound(PathBuf),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("failed to back up {path}: {source}")]
    BackupFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Classify for VhostError {
    fn code(&self) -> ErrorCode {
        match self {
            VhostError::SectionNotFound(_) => ErrorCode::ConfigSectionNotFound,
            VhostError::Lock(LockError::Timeout { .. }) => ErrorCode::LockTimeout,
            VhostError::Lock(LockError::Io { .. }) => ErrorCode::IoError,
            VhostError::BackupFailed { .. } => ErrorCode::BackupFailed,
            VhostError::Io { .. } => ErrorCode::IoError,
        }
    }
}

/// Outcome of a regeneration
#[derive(Debug, Clone, Serialize)]
pub struct Regenerated {
    pub backup: PathBuf,
    pub active_sites: usize,
    /// False when the new section matched what was already on disk
    pub changed: bool,
}

#[derive(Debug, Clone)]
pub struct VhostConfig {
    path: PathBuf,
    backup_dir: PathBuf,
    ssl_dir: PathBuf,
    settings: VhostSettings,
    lock_timeout: Duration,
}

impl VhostConfig {
    pub fn new(
        path: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        ssl_dir: impl Into<PathBuf>,
        settings: VhostSettings,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            path: path.into(),
            backup_dir: backup_dir.into(),
            ssl_dir: ssl_dir.into(),
            settings,
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Render the managed section body for the active sites, ordered by id
    pub fn render(&self, sites: &[Site]) -> String {
        let mut active: Vec<&Site> = sites.iter().filter(|s| s.is_active()).collect();
        active.sort_by_key(|s| s.id);

        let blocks: Vec<String> = active.iter().map(|site| self.render_site(site)).collect();
        blocks.join("\n")
    }

    fn render_site(&self, site: &Site) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# {} (site {})", site.domain, site.id);
        out.push_str("server {\n");
        out.push_str("    listen 80;\n");
        if site.ssl_enabled {
            let cert = self.ssl_dir.join(format!("{}.crt", site.domain));
            let key = self.ssl_dir.join(format!("{}.key", site.domain));
            out.push_str("    listen 443 ssl;\n");
            let _ = writeln!(out, "    ssl_certificate {};", cert.display());
            let _ = writeln!(out, "    ssl_certificate_key {};", key.display());
        }
        let _ = writeln!(out, "    server_name {};", site.domain);
        let _ = writeln!(out, "    root {};", site.document_root);
        let _ = writeln!(out, "    index {};", self.settings.index);
        out.push('\n');
        out.push_str("    location / {\n");
        out.push_str("        try_files $uri $uri/ /index.php?$query_string;\n");
        out.push_str("    }\n");
        out.push('\n');
        out.push_str("    location ~ \\.php$ {\n");
        out.push_str("        include fastcgi_params;\n");
        let _ = writeln!(out, "        fastcgi_pass {};", self.settings.php_upstream);
        out.push_str("        fastcgi_param SCRIPT_FILENAME $document_root$fastcgi_script_name;\n");
        out.push_str("    }\n");
        out.push_str("}\n");
        out
    }

    /// The full file as it would look after regeneration, without writing it.
    /// Bytes that are not UTF-8 are replaced for display.
    pub fn preview(&self, sites: &[Site]) -> Result<String, VhostError> {
        let content = std::fs::read(&self.path).map_err(|source| self.io_error(source))?;
        let updated = self.splice(&content, &self.render(sites))?;
        Ok(String::from_utf8_lossy(&updated).into_owned())
    }

    /// Rewrite the managed section from `sites`.
    ///
    /// The previous file is backed up first; a failed backup or a missing
    /// section leaves the live file untouched. The web server is not reloaded.
    pub fn regenerate(&self, sites: &[Site]) -> Result<Regenerated, VhostError> {
        let body = self.render(sites);
        let active_sites = sites.iter().filter(|s| s.is_active()).count();

        let mut locked = LockedFile::acquire(&self.path, self.lock_timeout)?;
        let content = locked.read_all().map_err(|source| self.io_error(source))?;
        let updated = self.splice(&content, &body)?;

        let backup = self.backup_bytes(&content)?;
        let changed = updated != content;
        if changed {
            locked
                .replace_contents(&updated)
                .map_err(|source| self.io_error(source))?;
        } else {
            debug!(path = %self.path.display(), "Virtual-host section already up to date");
        }

        info!(
            path = %self.path.display(),
            active_sites,
            changed,
            backup = %backup.path.display(),
            "Virtual-host configuration regenerated"
        );
        Ok(Regenerated {
            backup: backup.path,
            active_sites,
            changed,
        })
    }

    pub fn list_backups(&self) -> Result<Vec<Backup>, VhostError> {
        backup::list(&self.backup_dir, &self.file_name()).map_err(|source| VhostError::Io {
            path: self.backup_dir.clone(),
            source,
        })
    }

    /// Replace the bytes between the marker lines with `body`
    fn splice(&self, content: &[u8], body: &str) -> Result<Vec<u8>, VhostError> {
        let begin = self.settings.begin_marker.trim().as_bytes();
        let end = self.settings.end_marker.trim().as_bytes();

        let mut offset = 0;
        let mut body_start = None;
        let mut body_end = None;
        for line in content.split_inclusive(|&b| b == b'\n') {
            let trimmed = line.trim_ascii();
            match body_start {
                None if trimmed == begin && line.ends_with(b"\n") => {
                    body_start = Some(offset + line.len());
                }
                Some(_) if trimmed == end => {
                    body_end = Some(offset);
                    break;
                }
                _ => {}
            }
            offset += line.len();
        }

        let (Some(start), Some(stop)) = (body_start, body_end) else {
            return Err(VhostError::SectionNotFound(self.path.clone()));
        };

        let mut out = Vec::with_capacity(content.len() + body.len());
        out.extend_from_slice(&content[..start]);
        out.extend_from_slice(body.as_bytes());
        out.extend_from_slice(&content[stop..]);
        Ok(out)
    }

    fn backup_bytes(&self, content: &[u8]) -> Result<Backup, VhostError> {
        backup::write_verified(&self.backup_dir, &self.file_name(), content).map_err(|source| {
            VhostError::BackupFailed {
                path: self.path.clone(),
                source,
            }
        })
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "vhosts.conf".to_string())
    }

    fn io_error(&self, source: io::Error) -> VhostError {
        VhostError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
