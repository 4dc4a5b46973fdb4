//! Free disk space queries

use std::path::Path;

/// Bytes available to unprivileged users on the filesystem holding `path`
#[cfg(unix)]
pub fn available_space(path: &Path) -> std::io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    // SAFETY: c_path is a valid NUL-terminated string and `stat` is only read
    // after statvfs reported success.
    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        #[allow(clippy::unnecessary_cast)]
        Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
    }
}

/// Space is not checked on this platform
#[cfg(not(unix))]
pub fn available_space(_path: &Path) -> std::io::Result<u64> {
    Ok(u64::MAX)
}
