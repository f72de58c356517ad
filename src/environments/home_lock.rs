use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::{FurnaceError, FurnaceResult};

pub const LOCK_FILE_NAME: &str = "furnace.lock";

/// Exclusive ownership of a furnace home directory.
///
/// Only the holder may run environments or change recipes under that home.
/// The lock is an advisory `flock` on `<home>/furnace.lock`, which also
/// records the holder's pid; the OS releases it when the process exits.
#[derive(Debug)]
pub struct HomeLock {
    path: PathBuf,
    file: File,
}

impl HomeLock {
    pub fn acquire(home: &Path) -> FurnaceResult<Self> {
        std::fs::create_dir_all(home)?;
        let path = home.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if !try_lock(&file)? {
            let mut owner = String::new();
            let _ = file.read_to_string(&mut owner);
            return Err(FurnaceError::HomeLocked {
                home: home.to_path_buf(),
                pid: owner.trim().parse().ok(),
            });
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        debug!("Locked furnace home {}", home.display());

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HomeLock {
    fn drop(&mut self) {
        // The file stays: unlinking it would let two processes lock different inodes.
        let _ = self.file.set_len(0);
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> FurnaceResult<bool> {
    use nix::errno::Errno;
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => Ok(true),
        Err(Errno::EAGAIN) => Ok(false),
        Err(e) => Err(FurnaceError::IoError(e.into())),
    }
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> FurnaceResult<bool> {
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused_with_owner_pid() {
        let home = tempfile::tempdir().unwrap();
        let held = HomeLock::acquire(home.path()).unwrap();
        assert!(held.path().ends_with(LOCK_FILE_NAME));

        match HomeLock::acquire(home.path()) {
            Err(FurnaceError::HomeLocked { pid, .. }) => {
                assert_eq!(pid, Some(std::process::id()))
            }
            other => panic!("expected HomeLocked, got {:?}", other),
        }

        drop(held);
        assert!(HomeLock::acquire(home.path()).is_ok());
    }

    #[test]
    fn creates_missing_home() {
        let root = tempfile::tempdir().unwrap();
        let home = root.path().join("nested").join(".furnace");
        let _held = HomeLock::acquire(&home).unwrap();
        assert!(home.join(LOCK_FILE_NAME).is_file());
    }
}
