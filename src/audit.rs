//! Append-only audit trail for privileged actions
//!
//! One line per action: `<RFC3339 timestamp> [<actor>] <description>`.
//! Retention and rotation are left to the operator.

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditLog {
    /// Open (or create) the audit log for appending
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush it before returning
    pub fn record(&self, actor: &str, description: &str) -> io::Result<()> {
        let line = format!(
            "{} [{}] {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            single_line(actor),
            single_line(description)
        );

        let mut file = self.file.lock();
        file.write_all(line.as_bytes())?;
        file.flush()?;

        debug!(actor, description, "Audit entry recorded");
        Ok(())
    }
}

/// Escape line breaks so an entry can never span lines
fn single_line(text: &str) -> String {
    text.replace('\r', "\\r").replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_appends_lines() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log = AuditLog::open(tmp.path().join("logs/audit.log")).unwrap();

        log.record("admin", "add virtual host demo.local").unwrap();
        log.record("cron", "exec backup-db all -> ok").unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[admin] add virtual host demo.local"));
        assert!(lines[1].contains("[cron] exec backup-db all"));
    }

    #[test]
    fn test_reopen_preserves_history() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("audit.log");

        AuditLog::open(&path).unwrap().record("admin", "first").unwrap();
        AuditLog::open(&path).unwrap().record("admin", "second").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn test_newlines_are_escaped() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log = AuditLog::open(tmp.path().join("audit.log")).unwrap();

        log.record("ad\nmin", "line one\nforged entry").unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("[ad\\nmin] line one\\nforged entry"));
    }
}
