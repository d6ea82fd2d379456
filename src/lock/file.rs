use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use super::{Lease, LockBackend};
use crate::error::Result;

/// Leases stored as `<dir>/<name>.lock` JSON files.
///
/// Works across processes (and hosts) that share `dir`. Files are created
/// with an atomic no-clobber rename, so a lock file is always complete.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        let file: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{file}.lock"))
    }

    fn create(&self, path: &Path, lease: &Lease) -> Result<bool> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer(&mut tmp, lease)?;
        tmp.flush()?;
        match tmp.persist_noclobber(path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error.into()),
        }
    }

    /// Remove the lock file only if it still holds exactly `seen`.
    ///
    /// The file is moved aside and re-read before deletion. If it changed
    /// between the read and the rename it is linked back without clobbering
    /// whatever may have been created in its place.
    fn remove_if_unchanged(&self, path: &Path, seen: &[u8]) -> Result<bool> {
        let aside = path.with_extension(format!("lock.{}", Uuid::new_v4().simple()));
        match fs::rename(path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let unchanged = fs::read(&aside).is_ok_and(|moved| moved == seen);
        if !unchanged && fs::hard_link(&aside, path).is_err() {
            log::warn!(
                "Lock file {} was replaced while being inspected",
                path.display()
            );
        }
        if let Err(e) = fs::remove_file(&aside) {
            log::debug!("Failed to remove {}: {e}", aside.display());
        }
        Ok(unchanged)
    }
}

/// Raw lock file contents, `None` when there is no file.
fn read_raw(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn parse_lease(raw: &[u8]) -> Option<Lease> {
    serde_json::from_slice(raw).ok()
}

impl LockBackend for FileBackend {
    fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(name);
        let now = Utc::now();
        let lease = Lease::new(name, ttl, now);

        if self.create(&path, &lease)? {
            return Ok(Some(lease));
        }

        let Some(raw) = read_raw(&path)? else {
            // released between our create and read
            return Ok(self.create(&path, &lease)?.then_some(lease));
        };
        if parse_lease(&raw).is_some_and(|held| !held.is_expired(now)) {
            return Ok(None);
        }

        // Expired or unreadable: reclaim what we read, then compete like everyone else.
        if self.remove_if_unchanged(&path, &raw)? && self.create(&path, &lease)? {
            log::debug!("Reclaimed expired lock {name}");
            return Ok(Some(lease));
        }
        Ok(None)
    }

    fn release(&self, lease: &Lease) -> Result<()> {
        let path = self.path_for(&lease.name);
        let Some(raw) = read_raw(&path)? else {
            return Ok(());
        };
        if parse_lease(&raw).is_some_and(|held| held.owner == lease.owner) {
            self.remove_if_unchanged(&path, &raw)?;
        }
        Ok(())
    }
}
