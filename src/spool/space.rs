//! Free-space check for the spool filesystem.

#![allow(unsafe_code)]

use std::ffi::CString;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tracing::warn;

use super::Spool;

fn available_bytes(path: &Path) -> io::Result<u64> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let mut st = MaybeUninit::<libc::statvfs>::zeroed();
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), st.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let st = unsafe { st.assume_init() };
    Ok(st.f_bavail as u64 * st.f_frsize as u64)
}

impl Spool {
    /// Whether the spool filesystem has room for `want` more bytes.
    ///
    /// A failing statvfs is reported as "no room": refusing a transfer is
    /// recoverable, filling the disk is not.
    pub fn is_enough_space(&self, want: u64) -> bool {
        match available_bytes(self.root()) {
            Ok(avail) => avail > want,
            Err(err) => {
                warn!(spool = %self.root().display(), %err, "cannot stat spool filesystem");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn space_check_is_sane() {
        let tmp = tempfile::tempdir().unwrap();
        let spool = Spool::new(tmp.path());
        assert!(spool.is_enough_space(1));
        assert!(!spool.is_enough_space(u64::MAX - 1));
    }
}
