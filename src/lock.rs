//! Exclusive advisory locks on shared system files
//!
//! [`LockedFile`] holds a `flock(LOCK_EX)` on an open handle for as long as it
//! lives. All reads and writes of a locked resource go through the handle so the
//! file is rewritten in place and the lock stays on the same inode.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// Interval between non-blocking lock attempts
const LOCK_POLL_INTERVAL_MS: u64 = 25;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock on {path}")]
    Timeout { path: PathBuf, waited: Duration },

    #[error("failed to open {path} for locking: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// An open file with an exclusive lock held until drop
#[derive(Debug)]
pub struct LockedFile {
    file: File,
    path: PathBuf,
}

impl LockedFile {
    /// Open `path` read/write and block until an exclusive lock is held or
    /// `timeout` elapses. The file must already exist.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| LockError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let started = Instant::now();
        loop {
            match try_lock_exclusive(&file) {
                Ok(true) => break,
                Ok(false) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(LockError::Timeout {
                            path: path.to_path_buf(),
                            waited,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_POLL_INTERVAL_MS));
                }
                Err(source) => {
                    return Err(LockError::Io {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            }
        }

        debug!(
            path = %path.display(),
            waited_ms = started.elapsed().as_millis() as u64,
            "Lock acquired"
        );
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the full current contents
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Append bytes at the end of the file and flush them to disk
    pub fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(bytes)?;
        self.file.sync_all()
    }

    /// Replace the whole contents in place
    pub fn replace_contents(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.set_len(0)?;
        self.file.write_all(bytes)?;
        self.file.sync_all()
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> io::Result<bool> {
    Ok(true)
}

#[cfg(unix)]
impl Drop for LockedFile {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;

        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_read_append_replace() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("hosts");
        std::fs::write(&path, "127.0.0.1 localhost\n").unwrap();

        let mut locked = LockedFile::acquire(&path, Duration::from_secs(1)).unwrap();
        locked.append(b"127.0.0.1 a.local\n").unwrap();
        assert_eq!(
            locked.read_all().unwrap(),
            b"127.0.0.1 localhost\n127.0.0.1 a.local\n"
        );

        locked.replace_contents(b"short\n").unwrap();
        drop(locked);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "short\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_second_lock_times_out_while_held() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("hosts");
        std::fs::write(&path, "").unwrap();

        let _held = LockedFile::acquire(&path, Duration::from_secs(1)).unwrap();
        let err = LockedFile::acquire(&path, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[test]
    fn test_lock_is_released_on_drop() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("hosts");
        std::fs::write(&path, "").unwrap();

        drop(LockedFile::acquire(&path, Duration::from_secs(1)).unwrap());
        assert!(LockedFile::acquire(&path, Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err =
            LockedFile::acquire(&tmp.path().join("nope"), Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, LockError::Io { .. }));
    }
}
