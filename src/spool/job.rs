//! Spool job enumeration.
//!
//! A job is one queued encrypted packet, identified by the content hash
//! of its on-disk bytes. Enumeration never decrypts: niceness comes from
//! the plaintext part of the envelope header.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use tracing::debug;

use super::{Direction, Spool};
use crate::core::{
    ENVELOPE_HEAD_SIZE, HASH_SIZE, HEX_ENCODED_HASH_LEN, MAGIC_ENV_V5, NOCK_SUFFIX, SpoolError,
};
use crate::crypto::NodeId;
use crate::envelope::EnvelopeHead;

/// One queued outbound or inbound packet.
#[derive(Debug, Clone)]
pub struct Job {
    /// Content hash of the stored envelope bytes; also the file name.
    pub hash: [u8; HASH_SIZE],
    /// Niceness from the envelope header.
    pub nice: u8,
    /// Size of the stored file in bytes.
    pub size: u64,
    /// Full path of the stored file.
    pub path: PathBuf,
}

fn hash_from_name(name: &str) -> Option<[u8; HASH_SIZE]> {
    if name.len() != HEX_ENCODED_HASH_LEN {
        return None;
    }
    let raw = hex::decode(name).ok()?;
    raw.try_into().ok()
}

impl Spool {
    /// Enumerate queued packets for a peer and direction.
    ///
    /// Files whose name is not a hex content hash, or whose envelope
    /// header does not carry the current magic, are skipped silently:
    /// foreign droppings must not break a session.
    pub fn jobs(&self, node: &NodeId, xx: Direction) -> Result<Vec<Job>, SpoolError> {
        let dir = self.dir(node, xx);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut jobs = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(hash) = hash_from_name(name) else { continue };

            let path = entry.path();
            let Ok(meta) = entry.metadata() else { continue };
            let mut head_raw = [0u8; ENVELOPE_HEAD_SIZE];
            let ok = File::open(&path)
                .and_then(|mut fd| fd.read_exact(&mut head_raw))
                .is_ok();
            if !ok {
                continue;
            }
            let head = EnvelopeHead::decode(&head_raw);
            if head.magic != MAGIC_ENV_V5.bytes {
                continue;
            }
            debug!(node = %node, xx = %xx, file = name, nice = head.nice, size = meta.len(), "job");
            jobs.push(Job { hash, nice: head.nice, size: meta.len(), path });
        }
        Ok(jobs)
    }

    /// Enumerate fully received but not yet checksummed packets.
    pub fn jobs_nock(&self, node: &NodeId) -> Result<Vec<([u8; HASH_SIZE], u64)>, SpoolError> {
        let dir = self.dir(node, Direction::Rx);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut jobs = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(NOCK_SUFFIX) else { continue };
            let Some(hash) = hash_from_name(stem) else { continue };
            let Ok(meta) = entry.metadata() else { continue };
            jobs.push((hash, meta.len()));
        }
        Ok(jobs)
    }
}
