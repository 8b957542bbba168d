//! Platform-specific durable sync and advisory locking
//!
//! `durable_sync` maps to the strongest "data reached the media" primitive
//! each platform offers. `FileLock` holds an advisory lock on the store
//! file for the lifetime of a handle: exclusive for writers, shared for
//! read-only opens.

use std::fs::File;
use std::io;
use std::path::Path;

/// Ensures data is durably written to persistent storage before returning.
///
/// Platform behaviors:
/// - Linux: fdatasync()
/// - macOS/iOS: fcntl(F_FULLFSYNC), plain fsync only reaches the drive cache
/// - Windows: FlushFileBuffers()
/// - Other: file.sync_data()
///
/// Blocks for the duration of the device flush; callers must not hold the
/// table write lock while calling this.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd comes from a live File reference.
        let result = unsafe { libc::fdatasync(fd) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd comes from a live File reference.
        let result = unsafe { libc::fcntl(fd, libc::F_FULLFSYNC) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        let handle = file.as_raw_handle();
        // SAFETY: handle comes from a live File reference.
        let result = unsafe { FlushFileBuffers(handle as *mut _) };
        if result != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}

/// Sync a directory entry so a created or removed file survives a crash.
/// A no-op where directories cannot be opened as files.
pub fn durable_sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)?;
        handle.sync_all()
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

/// Advisory whole-file lock, released when dropped.
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Lock `file` without blocking. Fails with `WouldBlock` when another
    /// handle holds a conflicting lock.
    pub fn acquire(file: &File, exclusive: bool) -> io::Result<Self> {
        let file = file.try_clone()?;
        Self::try_lock(&file, exclusive)?;
        Ok(Self { file })
    }

    #[cfg(unix)]
    fn try_lock(file: &File, exclusive: bool) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        let mode = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
        // SAFETY: flock on a valid fd owned by `file`.
        let result = unsafe { libc::flock(file.as_raw_fd(), mode | libc::LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(windows)]
    fn try_lock(file: &File, exclusive: bool) -> io::Result<()> {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::LockFileEx;
        use winapi::um::minwinbase::OVERLAPPED;
        use winapi::um::winnt::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

        let mut flags = LOCKFILE_FAIL_IMMEDIATELY;
        if exclusive {
            flags |= LOCKFILE_EXCLUSIVE_LOCK;
        }
        // SAFETY: zeroed OVERLAPPED is the documented "offset 0" request.
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        let result = unsafe {
            LockFileEx(file.as_raw_handle() as *mut _, flags, 0, !0, !0, &mut overlapped)
        };
        if result == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn try_lock(_file: &File, _exclusive: bool) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: unlocking the fd we locked.
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        // Windows releases the lock when the cloned handle closes.
    }
}
