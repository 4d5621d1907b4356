//! On-disk spool: the per-peer, per-direction queue of encrypted packets.
//!
//! Layout: `<root>/<node-hex>/{rx,tx}/<hash-hex>[.part|.nock|.seen]`.
//! A queued packet moves strictly forward: absent → `.part` (partially
//! received) → `.nock` (complete, checksum deferred) → final name
//! (complete and verified). Every rename is followed by a directory
//! fsync so a crash never observes a finished name without its bytes.

mod job;
mod lock;
mod space;

pub use job::Job;
pub use lock::DirLock;

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use blake2::Digest;
use tracing::debug;

use crate::core::{HASH_SIZE, NOCK_SUFFIX, SpoolError};
use crate::crypto::{Blake2b256, NodeId};

/// Spool transfer direction, from our point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Packets received from the peer.
    Rx,
    /// Packets queued for the peer.
    Tx,
}

impl Direction {
    /// Directory name of this direction.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Rx => "rx",
            Direction::Tx => "tx",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle on the spool root directory.
#[derive(Debug, Clone)]
pub struct Spool {
    root: PathBuf,
}

/// Fsync a directory, making a preceding rename durable.
pub fn dir_sync(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Hash a file's full contents with the spool content hash.
pub fn hash_file(path: &Path) -> std::io::Result<[u8; HASH_SIZE]> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Blake2b256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

impl Spool {
    /// Open a spool at the given root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The spool root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-peer directory.
    pub fn node_dir(&self, node: &NodeId) -> PathBuf {
        self.root.join(node.to_string())
    }

    /// Per-peer, per-direction directory.
    pub fn dir(&self, node: &NodeId, xx: Direction) -> PathBuf {
        self.node_dir(node).join(xx.as_str())
    }

    /// Path of a queued packet file.
    pub fn file_path(&self, node: &NodeId, xx: Direction, hash: &[u8; HASH_SIZE]) -> PathBuf {
        self.dir(node, xx).join(hex::encode(hash))
    }

    /// Make sure the peer's receive directory exists.
    pub fn ensure_rx_dir(&self, node: &NodeId) -> Result<(), SpoolError> {
        let dir = self.dir(node, Direction::Rx);
        std::fs::create_dir_all(&dir)?;
        Ok(())
    }

    /// Verify a `.nock` file against its content hash and promote it to
    /// its final name.
    ///
    /// Returns the file size on success. On mismatch the `.nock` file is
    /// left in place for an offline verification pass.
    pub fn check_nock(&self, node: &NodeId, hash: &[u8; HASH_SIZE]) -> Result<u64, SpoolError> {
        let final_path = self.file_path(node, Direction::Rx, hash);
        let nock_path = final_path.with_file_name(format!("{}{}", hex::encode(hash), NOCK_SUFFIX));

        let size = std::fs::metadata(&nock_path)?.len();
        let got = hash_file(&nock_path)?;
        if &got != hash {
            return Err(SpoolError::ChecksumMismatch { pkt: hex::encode(hash) });
        }
        std::fs::rename(&nock_path, &final_path)?;
        dir_sync(&self.dir(node, Direction::Rx))?;
        debug!(node = %node, pkt = %hex::encode(hash), size, "checksummed");
        Ok(size)
    }

    /// Remove a transmitted packet once the peer confirmed receipt.
    ///
    /// The file may already be gone (e.g. a repeated Done); that is not
    /// an error.
    pub fn remove_tx(&self, node: &NodeId, hash: &[u8; HASH_SIZE]) -> Result<bool, SpoolError> {
        let path = self.file_path(node, Direction::Tx, hash);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{LocalIdentity, content_hash};
    use crate::envelope::{Pkt, PktType, seal};
    use std::io::Cursor;

    fn queue_packet(spool: &Spool, from: &LocalIdentity, to: &LocalIdentity, nice: u8) -> Job {
        let pkt = Pkt::new(PktType::File, nice, b"file.bin").unwrap();
        let payload = vec![nice; 2048];
        let mut wire = Vec::new();
        seal(from, &to.peer_view(), &pkt, nice, payload.len() as u64, 0,
            &mut Cursor::new(&payload), &mut wire)
            .unwrap();

        let hash = content_hash(&wire);
        let dir = spool.dir(&to.id, Direction::Tx);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(hex::encode(hash));
        std::fs::write(&path, &wire).unwrap();
        Job { hash, nice, size: wire.len() as u64, path }
    }

    #[test]
    fn jobs_enumerates_queued_packets() {
        let tmp = tempfile::tempdir().unwrap();
        let spool = Spool::new(tmp.path());
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();

        let a = queue_packet(&spool, &alice, &bob, 32);
        let b = queue_packet(&spool, &alice, &bob, 96);
        // Junk that must be ignored.
        std::fs::write(spool.dir(&bob.id, Direction::Tx).join("not-a-hash"), b"junk").unwrap();

        let mut jobs = spool.jobs(&bob.id, Direction::Tx).unwrap();
        jobs.sort_by_key(|j| j.nice);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].hash, a.hash);
        assert_eq!(jobs[0].nice, 32);
        assert_eq!(jobs[1].hash, b.hash);
        assert_eq!(jobs[1].size, b.size);
    }

    #[test]
    fn jobs_of_missing_dir_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let spool = Spool::new(tmp.path());
        let node = LocalIdentity::generate().id;
        assert!(spool.jobs(&node, Direction::Tx).unwrap().is_empty());
        assert!(spool.jobs_nock(&node).unwrap().is_empty());
    }

    #[test]
    fn check_nock_promotes_verified_file() {
        let tmp = tempfile::tempdir().unwrap();
        let spool = Spool::new(tmp.path());
        let node = LocalIdentity::generate().id;
        spool.ensure_rx_dir(&node).unwrap();

        let body = vec![0x5a; 4096];
        let hash = content_hash(&body);
        let final_path = spool.file_path(&node, Direction::Rx, &hash);
        let nock = final_path.with_file_name(format!("{}{}", hex::encode(hash), NOCK_SUFFIX));
        std::fs::write(&nock, &body).unwrap();

        let found = spool.jobs_nock(&node).unwrap();
        assert_eq!(found, vec![(hash, body.len() as u64)]);

        let size = spool.check_nock(&node, &hash).unwrap();
        assert_eq!(size, body.len() as u64);
        assert!(final_path.exists());
        assert!(!nock.exists());
    }

    #[test]
    fn check_nock_keeps_corrupt_file() {
        let tmp = tempfile::tempdir().unwrap();
        let spool = Spool::new(tmp.path());
        let node = LocalIdentity::generate().id;
        spool.ensure_rx_dir(&node).unwrap();

        let hash = content_hash(b"what the bytes should have been");
        let nock = spool
            .file_path(&node, Direction::Rx, &hash)
            .with_file_name(format!("{}{}", hex::encode(hash), NOCK_SUFFIX));
        std::fs::write(&nock, b"corrupted").unwrap();

        let err = spool.check_nock(&node, &hash).unwrap_err();
        assert!(matches!(err, SpoolError::ChecksumMismatch { .. }));
        assert!(nock.exists());
    }

    #[test]
    fn remove_tx_tolerates_absence() {
        let tmp = tempfile::tempdir().unwrap();
        let spool = Spool::new(tmp.path());
        let alice = LocalIdentity::generate();
        let bob = LocalIdentity::generate();

        let job = queue_packet(&spool, &alice, &bob, 10);
        assert!(spool.remove_tx(&bob.id, &job.hash).unwrap());
        assert!(!spool.remove_tx(&bob.id, &job.hash).unwrap());
    }
}
