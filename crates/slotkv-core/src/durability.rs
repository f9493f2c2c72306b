//! Platform file primitives for the on-disk table: durable sync and
//! positional reads.
//!
//! `File::sync_data` is not strong enough everywhere: on Apple platforms it
//! stops at the drive's volatile cache. Each platform maps to the strongest
//! primitive it offers.

use std::fs::File;
use std::io;
use std::path::Path;

/// Block until everything written to `file` has reached persistent media.
///
/// - Linux: `fdatasync()`
/// - macOS/iOS: `fcntl(F_FULLFSYNC)`
/// - Windows: `FlushFileBuffers()`
/// - Other: `File::sync_data()`
///
/// Must not be called while holding a shard mutex.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd belongs to a live `File` borrowed for the whole call.
        let rc = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd belongs to a live `File` borrowed for the whole call.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        // SAFETY: the handle belongs to a live `File` borrowed for the whole call.
        let ok = unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) };
        if ok != 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}

/// Persist a rename by syncing the parent directory.
///
/// Directories cannot be opened as files on Windows; there the rename is
/// already durable once `MoveFileEx` returns, so this is a no-op.
pub fn sync_parent_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let dir = File::open(parent)?;
            durable_sync(&dir)?;
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Fill `buf` from `file` starting at `offset`, without touching the file cursor.
///
/// Safe to call from several threads sharing one `&File`.
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.read_exact_at(buf, offset)
    }

    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut buf = buf;
        let mut offset = offset;
        while !buf.is_empty() {
            match file.seek_read(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "failed to fill whole buffer"));
                }
                Ok(n) => {
                    let rest = buf;
                    buf = &mut rest[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = (file, buf, offset);
        Err(io::Error::new(io::ErrorKind::Unsupported, "positional reads are not supported on this platform"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_durable_sync_success() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"bytes that must survive power loss").unwrap();
        assert!(durable_sync(file.as_file()).is_ok());
    }

    #[test]
    fn test_read_exact_at_ignores_cursor() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();

        let mut buf = [0u8; 4];
        read_exact_at(file.as_file(), &mut buf, 3).unwrap();
        assert_eq!(&buf, b"3456");

        let mut past_end = [0u8; 4];
        let err = read_exact_at(file.as_file(), &mut past_end, 8).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_sync_parent_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("table.skv");
        std::fs::write(&path, b"x").unwrap();
        assert!(sync_parent_dir(&path).is_ok());
    }
}
