//! Hosts-file alias management
//!
//! [`HostsFile`] owns every read and write of the shared alias file. Mutations
//! take an exclusive lock, write a verified backup, and only then touch the live
//! file. Lines are only ever appended or removed whole; a line mapping several
//! domains loses just the matching token.

use crate::backup::{self, Backup};
use crate::error::{Classify, ErrorCode};
use crate::lock::{LockError, LockedFile};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum HostsError {
    #[error("invalid alias domain '{0}'")]
    InvalidDomain(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("failed to back up {path}: {source}")]
    BackupFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("backup not found: {0}")]
    BackupNotFound(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Classify for HostsError {
    fn code(&self) -> ErrorCode {
        match self {
            HostsError::InvalidDomain(_) => ErrorCode::InvalidInput,
            HostsError::Lock(LockError::Timeout { .. }) => ErrorCode::LockTimeout,
            HostsError::Lock(LockError::Io { .. }) => ErrorCode::IoError,
            HostsError::BackupFailed { .. } => ErrorCode::BackupFailed,
            HostsError::BackupNotFound(_) => ErrorCode::BackupNotFound,
            HostsError::Io { .. } => ErrorCode::IoError,
        }
    }
}

/// Result of an idempotent alias mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasChange {
    /// The file already had the desired state; nothing was written
    Unchanged,
    /// The live file was modified after taking this backup
    Changed { backup: PathBuf },
}

impl AliasChange {
    pub fn is_changed(&self) -> bool {
        matches!(self, AliasChange::Changed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct HostsFile {
    path: PathBuf,
    backup_dir: PathBuf,
    address: String,
    local_suffix: String,
    lock_timeout: Duration,
}

impl HostsFile {
    pub fn new(
        path: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        address: impl Into<String>,
        local_suffix: impl Into<String>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            path: path.into(),
            backup_dir: backup_dir.into(),
            address: address.into(),
            local_suffix: local_suffix.into(),
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Map `domain` to the loopback address unless it already is
    pub fn add_alias(&self, domain: &str) -> Result<AliasChange, HostsError> {
        validate_alias_domain(domain)?;

        let mut locked = self.lock()?;
        let content = self.read_locked(&mut locked)?;
        if has_mapping(&content, &self.address, domain) {
            debug!(domain, "Alias already present");
            return Ok(AliasChange::Unchanged);
        }

        let backup = self.backup_bytes(&content)?;

        let eol = if content.windows(2).any(|w| w == b"\r\n") {
            "\r\n"
        } else {
            "\n"
        };
        let mut line = String::new();
        if !content.is_empty() && !content.ends_with(b"\n") {
            line.push_str(eol);
        }
        line.push_str(&format!("{} {}{}", self.address, domain, eol));
        locked
            .append(line.as_bytes())
            .map_err(|source| self.io_error(source))?;

        info!(domain, address = %self.address, backup = %backup.path.display(), "Alias added");
        Ok(AliasChange::Changed {
            backup: backup.path,
        })
    }

    /// Remove the loopback mapping for `domain` if present
    pub fn remove_alias(&self, domain: &str) -> Result<AliasChange, HostsError> {
        validate_alias_domain(domain)?;

        let mut locked = self.lock()?;
        let content = self.read_locked(&mut locked)?;
        if !has_mapping(&content, &self.address, domain) {
            debug!(domain, "Alias not present");
            return Ok(AliasChange::Unchanged);
        }

        let backup = self.backup_bytes(&content)?;
        let rewritten = without_mapping(&content, &self.address, domain);
        locked
            .replace_contents(&rewritten)
            .map_err(|source| self.io_error(source))?;

        info!(domain, address = %self.address, backup = %backup.path.display(), "Alias removed");
        Ok(AliasChange::Changed {
            backup: backup.path,
        })
    }

    /// Local-development domains mapped to the loopback address, in file order
    pub fn list_aliases(&self) -> Result<Vec<String>, HostsError> {
        let content = std::fs::read(&self.path).map_err(|source| self.io_error(source))?;
        Ok(local_aliases(&content, &self.address, &self.local_suffix))
    }

    /// Take a verified backup of the current file
    pub fn backup(&self) -> Result<Backup, HostsError> {
        let mut locked = self.lock()?;
        let content = self.read_locked(&mut locked)?;
        self.backup_bytes(&content)
    }

    pub fn list_backups(&self) -> Result<Vec<Backup>, HostsError> {
        backup::list(&self.backup_dir, &self.file_name()).map_err(|source| HostsError::Io {
            path: self.backup_dir.clone(),
            source,
        })
    }

    /// Replace the live file with a backup's contents.
    ///
    /// The current contents are backed up first, so a restore can itself be undone.
    pub fn restore(&self, requested: &Path) -> Result<AliasChange, HostsError> {
        let source = backup::resolve(&self.backup_dir, requested)
            .ok_or_else(|| HostsError::BackupNotFound(requested.to_path_buf()))?;
        let restored = std::fs::read(&source).map_err(|source_err| HostsError::Io {
            path: source.clone(),
            source: source_err,
        })?;

        let mut locked = self.lock()?;
        let content = self.read_locked(&mut locked)?;
        let backup = self.backup_bytes(&content)?;
        locked
            .replace_contents(&restored)
            .map_err(|source| self.io_error(source))?;

        info!(from = %source.display(), backup = %backup.path.display(), "Hosts file restored");
        Ok(AliasChange::Changed {
            backup: backup.path,
        })
    }

    /// Whether `domain` follows the local-development naming convention
    pub fn is_local(&self, domain: &str) -> bool {
        is_local_domain(domain, &self.local_suffix)
    }

    fn lock(&self) -> Result<LockedFile, HostsError> {
        Ok(LockedFile::acquire(&self.path, self.lock_timeout)?)
    }

    fn read_locked(&self, locked: &mut LockedFile) -> Result<Vec<u8>, HostsError> {
        locked.read_all().map_err(|source| self.io_error(source))
    }

    fn backup_bytes(&self, content: &[u8]) -> Result<Backup, HostsError> {
        backup::write_verified(&self.backup_dir, &self.file_name(), content).map_err(|source| {
            HostsError::BackupFailed {
                path: self.path.clone(),
                source,
            }
        })
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "hosts".to_string())
    }

    fn io_error(&self, source: io::Error) -> HostsError {
        HostsError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Reject anything that could break out of a single hosts-file token
pub fn validate_alias_domain(domain: &str) -> Result<(), HostsError> {
    let valid = !domain.is_empty()
        && domain.len() <= 253
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(HostsError::InvalidDomain(domain.to_string()))
    }
}

pub fn is_local_domain(domain: &str, suffix: &str) -> bool {
    domain.len() > suffix.len() && domain.ends_with(suffix)
}

/// Byte ranges of the whitespace-separated tokens in `data`
fn token_spans(data: &[u8]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;
    for (i, b) in data.iter().enumerate() {
        match (b.is_ascii_whitespace(), start) {
            (false, None) => start = Some(i),
            (true, Some(s)) => {
                spans.push((s, i));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push((s, data.len()));
    }
    spans
}

/// The part of a line before any `#` comment
fn data_part(line: &[u8]) -> &[u8] {
    match line.iter().position(|&b| b == b'#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Split a hosts line into its address and domain tokens, ignoring comments
fn parse_line(line: &[u8]) -> Option<(&[u8], Vec<&[u8]>)> {
    let data = data_part(line);
    let mut tokens = token_spans(data).into_iter().map(|(s, e)| &data[s..e]);
    let address = tokens.next()?;
    Some((address, tokens.collect()))
}

fn line_maps(line: &[u8], address: &str, domain: &str) -> bool {
    match parse_line(line) {
        Some((addr, domains)) => {
            addr == address.as_bytes() && domains.iter().any(|d| *d == domain.as_bytes())
        }
        None => false,
    }
}

fn has_mapping(content: &[u8], address: &str, domain: &str) -> bool {
    content
        .split(|&b| b == b'\n')
        .any(|line| line_maps(line, address, domain))
}

/// Drop the `domain` token from lines mapping `address`, byte for byte otherwise.
///
/// A line left without domains is removed whole. Separators, comments and
/// line endings of the remaining lines are kept as they were.
fn without_mapping(content: &[u8], address: &str, domain: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len());

    for line in content.split_inclusive(|&b| b == b'\n') {
        if !line_maps(line, address, domain) {
            out.extend_from_slice(line);
            continue;
        }

        let data = data_part(line);
        let spans = token_spans(data);
        let kept: Vec<usize> = (1..spans.len())
            .filter(|&i| &data[spans[i].0..spans[i].1] != domain.as_bytes())
            .collect();
        if kept.is_empty() {
            continue;
        }

        // Each kept token brings the separator that preceded it
        out.extend_from_slice(&line[..spans[0].1]);
        for i in kept {
            out.extend_from_slice(&data[spans[i - 1].1..spans[i].1]);
        }
        let last_end = spans.last().map_or(0, |span| span.1);
        out.extend_from_slice(&line[last_end..]);
    }

    out
}

fn local_aliases(content: &[u8], address: &str, suffix: &str) -> Vec<String> {
    let mut aliases: Vec<String> = Vec::new();
    for line in content.split(|&b| b == b'\n') {
        let Some((addr, domains)) = parse_line(line) else {
            continue;
        };
        if addr != address.as_bytes() {
            continue;
        }
        for domain in domains.into_iter().filter_map(|d| std::str::from_utf8(d).ok()) {
            if is_local_domain(domain, suffix) && !aliases.iter().any(|a| a == domain) {
                aliases.push(domain.to_string());
            }
        }
    }
    aliases
}
