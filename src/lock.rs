//! Exclusive advisory lock on a data directory.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

pub const LOCK_FILE: &str = "repository.lock";

/// Held for as long as a repository owns its data directory. The kernel
/// drops the lock when the file closes, including on crash.
#[derive(Debug)]
pub struct DirectoryLock {
    path: PathBuf,
    _file: File,
}

impl DirectoryLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        if !try_lock(&file)? {
            return Err(Error::DirectoryLocked);
        }
        write_lock_record(&file)?;
        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Pid recorded by the last process that took the lock, if any.
pub fn lock_owner(dir: &Path) -> Result<Option<u32>> {
    let mut contents = String::new();
    match File::open(dir.join(LOCK_FILE)) {
        Ok(mut file) => file.read_to_string(&mut contents)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(contents.trim().parse().ok())
}

fn write_lock_record(file: &File) -> Result<()> {
    let mut handle = file.try_clone()?;
    handle.set_len(0)?;
    handle.seek(SeekFrom::Start(0))?;
    writeln!(handle, "{}", std::process::id())?;
    handle.sync_all()?;
    Ok(())
}

#[cfg(unix)]
fn try_lock(file: &File) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if res == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return Ok(false);
    }
    Err(Error::Io(err))
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> Result<bool> {
    Ok(true)
}
