//! index lock file: `<index>.lock` created exclusively, streamed,
//! then renamed over the canonical file or removed

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, IoResultExt, Result};

/// holds `<target>.lock` until committed or rolled back; dropping an
/// uncommitted lock rolls it back
pub struct IndexLock {
    target: PathBuf,
    lock_path: PathBuf,
    file: Option<File>,
    resolved: bool,
}

impl IndexLock {
    /// take the lock with O_CREAT|O_EXCL; an existing lock file means
    /// another writer owns the index
    pub fn acquire(target: &Path) -> Result<Self> {
        let lock_path = lock_path_for(target);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    Error::IndexLockHeld(lock_path.clone())
                } else {
                    Error::Io {
                        path: lock_path.clone(),
                        source: e,
                    }
                }
            })?;
        debug!("acquired index lock {}", lock_path.display());
        Ok(Self {
            target: target.to_path_buf(),
            lock_path,
            file: Some(file),
            resolved: false,
        })
    }

    /// stream new index contents into the lock file
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let file = self.file.as_mut().expect("lock is open");
        file.write_all(bytes).with_path(&self.lock_path)?;
        Ok(())
    }

    /// fsync and rename the lock file over the canonical index
    pub fn commit(mut self) -> Result<()> {
        let file = self.file.take().expect("lock is open");
        file.sync_all().with_path(&self.lock_path)?;
        drop(file);
        std::fs::rename(&self.lock_path, &self.target).with_path(&self.target)?;
        self.resolved = true;
        Ok(())
    }

    /// abandon the write and remove the lock file
    pub fn rollback(mut self) -> Result<()> {
        self.file.take();
        std::fs::remove_file(&self.lock_path).with_path(&self.lock_path)?;
        self.resolved = true;
        Ok(())
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        // an uncommitted lock must never outlive its owner
        if !self.resolved {
            self.file.take();
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}
