// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The on-disk ring file backing a durable queue.
//!
//! Layout: a fixed 1024-byte header followed by length-prefixed records.
//! Writes proceed sequentially and wrap back to the header boundary when
//! the configured maximum is reached; a zero length prefix (or too little
//! room for one) marks the wrap point for the reader. The header is only
//! checkpointed every `sync_freq` writes and on `stop()`, so a crash can
//! lose at most the records of the last sync window; the queue contract
//! is at-least-once, not exactly-once.
//!
//! For reliable queues the read head may run ahead of `backlog_head`;
//! the region between them holds delivered-but-unacked records that a
//! restart re-delivers. Non-reliable queues keep their backlog in memory
//! and `backlog_head` tracks the read head.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use std::collections::VecDeque;

pub const HEADER_SIZE: u64 = 1024;
pub const QDISK_VERSION: u8 = 1;

const MAGIC_NON_RELIABLE: &[u8; 4] = b"SLQF";
const MAGIC_RELIABLE: &[u8; 4] = b"SLQR";

/// Header flags byte.
const FLAG_BIG_ENDIAN: u8 = 0x01;
const FLAG_SUPPORTS_UNSET: u8 = 0x02;

#[derive(Debug, thiserror::Error)]
pub enum QDiskError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{path}: not a queue file (bad magic)")]
    BadMagic { path: PathBuf },
    #[error("{path}: queue file flavor mismatch")]
    FlavorMismatch { path: PathBuf },
    #[error("{path}: unsupported queue file version {version}")]
    BadVersion { path: PathBuf, version: u8 },
    #[error("{path}: corrupt queue file ({reason})")]
    Corrupt { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct QDiskOptions {
    /// Ring capacity including the header, in bytes.
    pub max_size: u64,
    /// Records between header checkpoints.
    pub sync_freq: u32,
}

impl Default for QDiskOptions {
    fn default() -> Self {
        QDiskOptions {
            max_size: 128 * 1024 * 1024,
            sync_freq: 64,
        }
    }
}

pub struct QDisk {
    file: File,
    path: PathBuf,
    reliable: bool,
    opts: QDiskOptions,
    /// Next record to pop.
    read_head: u64,
    /// Next write position.
    write_head: u64,
    /// Oldest byte still retained (un-acked delivery for reliable files).
    backlog_head: u64,
    /// Unread records between `read_head` and `write_head`.
    length: u64,
    /// Positions of delivered-but-unacked records (reliable only).
    backlog: VecDeque<u64>,
    dropped: u64,
    writes_since_sync: u32,
}

impl QDisk {
    /// Open or create the queue file, replaying header state.
    ///
    /// Delivered-but-unacked records of a previous run move back to the
    /// read head so they are delivered again.
    pub fn start(path: &Path, reliable: bool, opts: QDiskOptions) -> Result<QDisk, QDiskError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let file_len = file.metadata()?.len();

        let mut qdisk = QDisk {
            file,
            path: path.to_path_buf(),
            reliable,
            opts,
            read_head: HEADER_SIZE,
            write_head: HEADER_SIZE,
            backlog_head: HEADER_SIZE,
            length: 0,
            backlog: VecDeque::new(),
            dropped: 0,
            writes_since_sync: 0,
        };

        if file_len < HEADER_SIZE {
            qdisk.checkpoint()?;
            return Ok(qdisk);
        }

        let mut header = [0u8; 64];
        qdisk.file.seek(SeekFrom::Start(0))?;
        qdisk.file.read_exact(&mut header)?;

        let expected_magic = if reliable {
            MAGIC_RELIABLE
        } else {
            MAGIC_NON_RELIABLE
        };
        let magic = &header[0..4];
        if magic != MAGIC_RELIABLE && magic != MAGIC_NON_RELIABLE {
            return Err(QDiskError::BadMagic {
                path: qdisk.path.clone(),
            });
        }
        if magic != expected_magic {
            return Err(QDiskError::FlavorMismatch {
                path: qdisk.path.clone(),
            });
        }
        let version = header[4];
        if version != QDISK_VERSION {
            return Err(QDiskError::BadVersion {
                path: qdisk.path.clone(),
                version,
            });
        }
        if header[5] & FLAG_BIG_ENDIAN != 0 {
            return Err(QDiskError::Corrupt {
                path: qdisk.path.clone(),
                reason: "big-endian queue files are not supported".into(),
            });
        }

        let read_u64 = |ofs: usize| u64::from_le_bytes(header[ofs..ofs + 8].try_into().unwrap());
        let read_head = read_u64(8);
        let write_head = read_u64(16);
        let length = read_u64(24);
        let dropped = read_u64(32);
        let backlog_head = read_u64(40);
        let backlog_count = u32::from_le_bytes(header[48..52].try_into().unwrap()) as u64;

        let in_range = |ofs: u64| (HEADER_SIZE..=opts.max_size.max(file_len)).contains(&ofs);
        if !in_range(read_head) || !in_range(write_head) || !in_range(backlog_head) {
            return Err(QDiskError::Corrupt {
                path: qdisk.path.clone(),
                reason: format!(
                    "head offsets out of range ({read_head}/{write_head}/{backlog_head})"
                ),
            });
        }

        // re-deliver anything that was popped but never acked
        qdisk.read_head = backlog_head;
        qdisk.write_head = write_head;
        qdisk.backlog_head = backlog_head;
        qdisk.length = length + backlog_count;
        qdisk.dropped = dropped;
        Ok(qdisk)
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn backlog_len(&self) -> u64 {
        self.backlog.len() as u64
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn note_dropped(&mut self) {
        self.dropped += 1;
    }

    fn total_records(&self) -> u64 {
        self.length + self.backlog.len() as u64
    }

    /// Where a record of `n` total bytes would land, or `None` when the
    /// ring is out of room.
    fn placement(&self, n: u64) -> Option<(u64, bool)> {
        if self.total_records() == 0 {
            // empty ring restarts at the header boundary
            return (HEADER_SIZE + n <= self.opts.max_size).then_some((HEADER_SIZE, false));
        }
        if self.write_head >= self.backlog_head {
            if self.write_head + n <= self.opts.max_size {
                return Some((self.write_head, false));
            }
            // wrap around to the start; the write head must stay strictly
            // below the backlog head or the ring would read as linear
            if HEADER_SIZE + n < self.backlog_head {
                return Some((HEADER_SIZE, true));
            }
            return None;
        }
        (self.write_head + n < self.backlog_head).then_some((self.write_head, false))
    }

    pub fn has_space(&self, body_len: usize) -> bool {
        self.placement(4 + body_len as u64).is_some()
    }

    /// Append one record; `false` means the ring is full.
    pub fn push(&mut self, body: &[u8]) -> Result<bool, QDiskError> {
        let n = 4 + body.len() as u64;
        let Some((pos, wrapped)) = self.placement(n) else {
            return Ok(false);
        };
        if self.total_records() == 0 && pos != self.write_head {
            // take the chance to shrink a fully drained file
            self.reset_heads()?;
        }
        if wrapped && self.opts.max_size - self.write_head >= 4 {
            self.file.seek(SeekFrom::Start(self.write_head))?;
            self.file.write_all(&0u32.to_le_bytes())?;
        }
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.write_all(&(body.len() as u32).to_le_bytes())?;
        self.file.write_all(body)?;
        self.write_head = pos + n;
        self.length += 1;

        self.writes_since_sync += 1;
        if self.writes_since_sync >= self.opts.sync_freq {
            self.checkpoint()?;
        }
        Ok(true)
    }

    fn normalized_read_pos(&mut self, pos: u64) -> Result<u64, QDiskError> {
        let mut pos = pos;
        if self.opts.max_size - pos.min(self.opts.max_size) < 4 {
            pos = HEADER_SIZE;
            return Ok(pos);
        }
        self.file.seek(SeekFrom::Start(pos))?;
        let mut len_buf = [0u8; 4];
        self.file.read_exact(&mut len_buf)?;
        if u32::from_le_bytes(len_buf) == 0 {
            pos = HEADER_SIZE;
        }
        Ok(pos)
    }

    fn read_record_at(&mut self, pos: u64) -> Result<(Vec<u8>, u64, u64), QDiskError> {
        let pos = self.normalized_read_pos(pos)?;
        self.file.seek(SeekFrom::Start(pos))?;
        let mut len_buf = [0u8; 4];
        self.file.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as u64;
        if len == 0 || pos + 4 + len > self.opts.max_size {
            return Err(QDiskError::Corrupt {
                path: self.path.clone(),
                reason: format!("record length {len} at {pos} exceeds ring bounds"),
            });
        }
        let mut body = vec![0u8; len as usize];
        self.file.read_exact(&mut body)?;
        Ok((body, pos, pos + 4 + len))
    }

    /// Pop the next record. For reliable files the record stays on disk,
    /// tracked as backlog until acked.
    pub fn pop(&mut self) -> Result<Option<Vec<u8>>, QDiskError> {
        if self.length == 0 {
            return Ok(None);
        }
        let (body, pos, next) = self.read_record_at(self.read_head)?;
        self.read_head = next;
        self.length -= 1;
        if self.reliable {
            self.backlog.push_back(pos);
        } else {
            self.backlog_head = self.read_head;
        }
        Ok(Some(body))
    }

    /// Read the next record without consuming it.
    pub fn peek(&mut self) -> Result<Option<Vec<u8>>, QDiskError> {
        if self.length == 0 {
            return Ok(None);
        }
        let (body, _, _) = self.read_record_at(self.read_head)?;
        Ok(Some(body))
    }

    /// Release the oldest `n` delivered records (reliable only).
    pub fn ack_backlog(&mut self, n: u64) -> Result<(), QDiskError> {
        for _ in 0..n {
            if self.backlog.pop_front().is_none() {
                break;
            }
        }
        self.backlog_head = self.backlog.front().copied().unwrap_or(self.read_head);
        if self.total_records() == 0 {
            self.reset_heads()?;
        }
        Ok(())
    }

    /// Step the read head back over the newest `n` delivered records so
    /// they are popped again. Returns how many were actually rewound.
    pub fn rewind_backlog(&mut self, n: u64) -> u64 {
        let mut rewound = 0;
        for _ in 0..n {
            let Some(pos) = self.backlog.pop_back() else {
                break;
            };
            self.read_head = pos;
            self.length += 1;
            rewound += 1;
        }
        rewound
    }

    /// Pull every retained record (un-acked backlog first, then unread)
    /// out of the ring, leaving it empty. Used to rebuild the file with
    /// in-memory segments folded in at shutdown.
    pub fn drain_all(&mut self) -> Result<Vec<Vec<u8>>, QDiskError> {
        let mut records = Vec::with_capacity(self.total_records() as usize);
        let backlog: Vec<u64> = self.backlog.iter().copied().collect();
        for pos in backlog {
            let (body, _, _) = self.read_record_at(pos)?;
            records.push(body);
        }
        while self.length > 0 {
            let (body, _, next) = self.read_record_at(self.read_head)?;
            self.read_head = next;
            self.length -= 1;
            records.push(body);
        }
        self.backlog.clear();
        self.reset_heads()?;
        Ok(records)
    }

    /// Rewrite the ring from scratch with `records` in order.
    pub fn rebuild(&mut self, records: &[Vec<u8>]) -> Result<u64, QDiskError> {
        self.reset_heads()?;
        let mut kept = 0;
        for body in records {
            if !self.push(body)? {
                self.dropped += 1;
                tracing::warn!(path = %self.path.display(), "queue file full while persisting, record dropped");
            } else {
                kept += 1;
            }
        }
        self.checkpoint()?;
        Ok(kept)
    }

    fn reset_heads(&mut self) -> Result<(), QDiskError> {
        self.read_head = HEADER_SIZE;
        self.write_head = HEADER_SIZE;
        self.backlog_head = HEADER_SIZE;
        self.file.set_len(HEADER_SIZE)?;
        Ok(())
    }

    /// Persist the header. Called every `sync_freq` writes, not per
    /// record.
    pub fn checkpoint(&mut self) -> Result<(), QDiskError> {
        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..4].copy_from_slice(if self.reliable {
            MAGIC_RELIABLE
        } else {
            MAGIC_NON_RELIABLE
        });
        header[4] = QDISK_VERSION;
        header[5] = FLAG_SUPPORTS_UNSET;
        header[8..16].copy_from_slice(&self.read_head.to_le_bytes());
        header[16..24].copy_from_slice(&self.write_head.to_le_bytes());
        header[24..32].copy_from_slice(&self.length.to_le_bytes());
        header[32..40].copy_from_slice(&self.dropped.to_le_bytes());
        header[40..48].copy_from_slice(&self.backlog_head.to_le_bytes());
        header[48..52].copy_from_slice(&(self.backlog.len() as u32).to_le_bytes());
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.sync_data()?;
        self.writes_since_sync = 0;
        Ok(())
    }

    /// Flush state for shutdown; returns whether records remain on disk.
    pub fn stop(&mut self) -> Result<bool, QDiskError> {
        self.checkpoint()?;
        self.file.sync_all()?;
        Ok(self.total_records() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(max: u64) -> QDiskOptions {
        QDiskOptions {
            max_size: max,
            sync_freq: 4,
        }
    }

    fn record(i: u32, len: usize) -> Vec<u8> {
        let mut body = vec![b'x'; len];
        body[..4].copy_from_slice(&i.to_le_bytes());
        body
    }

    #[test]
    fn push_pop_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.slqf");
        let mut disk = QDisk::start(&path, false, opts(1 << 20)).unwrap();
        for i in 0..10u32 {
            assert!(disk.push(&record(i, 100)).unwrap());
        }
        assert_eq!(disk.len(), 10);
        for i in 0..10u32 {
            let body = disk.pop().unwrap().unwrap();
            assert_eq!(&body[..4], &i.to_le_bytes());
        }
        assert!(disk.pop().unwrap().is_none());
    }

    #[test]
    fn full_ring_refuses_push() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.slqf");
        let mut disk = QDisk::start(&path, false, opts(HEADER_SIZE + 300)).unwrap();
        assert!(disk.push(&record(0, 100)).unwrap());
        assert!(disk.push(&record(1, 100)).unwrap());
        // 2 * 104 = 208; a third would need 312 total
        assert!(!disk.push(&record(2, 100)).unwrap());
    }

    #[test]
    fn wraps_after_drain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.slqf");
        let mut disk = QDisk::start(&path, false, opts(HEADER_SIZE + 260)).unwrap();
        // each record occupies 104 bytes; two fit
        for round in 0..20u32 {
            assert!(disk.push(&record(round, 100)).unwrap(), "round {round}");
            let body = disk.pop().unwrap().unwrap();
            assert_eq!(&body[..4], &round.to_le_bytes());
        }
    }

    #[test]
    fn reliable_backlog_rewind_redelivers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.slqr");
        let mut disk = QDisk::start(&path, true, opts(1 << 20)).unwrap();
        for i in 0..5u32 {
            disk.push(&record(i, 50)).unwrap();
        }
        for _ in 0..5 {
            disk.pop().unwrap().unwrap();
        }
        assert_eq!(disk.backlog_len(), 5);
        disk.ack_backlog(3).unwrap();
        assert_eq!(disk.backlog_len(), 2);

        assert_eq!(disk.rewind_backlog(2), 2);
        let again = disk.pop().unwrap().unwrap();
        assert_eq!(&again[..4], &3u32.to_le_bytes());
        let again = disk.pop().unwrap().unwrap();
        assert_eq!(&again[..4], &4u32.to_le_bytes());
    }

    #[test]
    fn restart_redelivers_unacked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.slqr");
        {
            let mut disk = QDisk::start(&path, true, opts(1 << 20)).unwrap();
            for i in 0..4u32 {
                disk.push(&record(i, 50)).unwrap();
            }
            disk.pop().unwrap().unwrap();
            disk.pop().unwrap().unwrap();
            disk.ack_backlog(1).unwrap();
            disk.stop().unwrap();
        }
        let mut disk = QDisk::start(&path, true, opts(1 << 20)).unwrap();
        // record 0 was acked; 1 was delivered but not acked
        assert_eq!(disk.len(), 3);
        let body = disk.pop().unwrap().unwrap();
        assert_eq!(&body[..4], &1u32.to_le_bytes());
    }

    #[test]
    fn flavor_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q");
        {
            let mut disk = QDisk::start(&path, false, opts(1 << 20)).unwrap();
            disk.push(&record(0, 10)).unwrap();
            disk.stop().unwrap();
        }
        assert!(matches!(
            QDisk::start(&path, true, opts(1 << 20)),
            Err(QDiskError::FlavorMismatch { .. })
        ));
    }

    #[test]
    fn garbage_header_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q");
        std::fs::write(&path, vec![0xAAu8; 2048]).unwrap();
        assert!(matches!(
            QDisk::start(&path, false, opts(1 << 20)),
            Err(QDiskError::BadMagic { .. })
        ));
    }

    #[test]
    fn drain_and_rebuild_preserve_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.slqf");
        let mut disk = QDisk::start(&path, false, opts(1 << 20)).unwrap();
        for i in 0..6u32 {
            disk.push(&record(i, 40)).unwrap();
        }
        let drained = disk.drain_all().unwrap();
        assert_eq!(drained.len(), 6);
        assert!(disk.is_empty());

        disk.rebuild(&drained).unwrap();
        assert_eq!(disk.len(), 6);
        for i in 0..6u32 {
            assert_eq!(&disk.pop().unwrap().unwrap()[..4], &i.to_le_bytes());
        }
    }
}
