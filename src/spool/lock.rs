//! Advisory per-direction spool locks.
//!
//! Two concurrent sessions with the same peer must not touch the same
//! spool direction. The lock is an advisory `flock` on a sidecar file,
//! held for the whole session and released on drop.

#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use tracing::warn;

use super::{Direction, Spool};
use crate::core::SpoolError;
use crate::crypto::NodeId;

/// A held spool-direction lock. Released when dropped.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            warn!(path = %self.path.display(), "failed to release spool lock");
        }
    }
}

impl Spool {
    /// Acquire the advisory lock for one spool direction of a peer.
    ///
    /// Fails with [`SpoolError::AlreadyLocked`] when another session
    /// holds it; never blocks.
    pub fn lock_dir(&self, node: &NodeId, xx: Direction) -> Result<DirLock, SpoolError> {
        let dir = self.node_dir(node);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{xx}.lock"));
        let file = OpenOptions::new().create(true).truncate(false).write(true).open(&path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(SpoolError::AlreadyLocked { dir: path.display().to_string() });
        }
        Ok(DirLock { file, path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalIdentity;

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let spool = Spool::new(tmp.path());
        let node = LocalIdentity::generate().id;

        let held = spool.lock_dir(&node, Direction::Rx).unwrap();
        let err = spool.lock_dir(&node, Direction::Rx).unwrap_err();
        assert!(matches!(err, SpoolError::AlreadyLocked { .. }));

        // The other direction is independent.
        let _tx = spool.lock_dir(&node, Direction::Tx).unwrap();

        drop(held);
        spool.lock_dir(&node, Direction::Rx).unwrap();
    }
}
