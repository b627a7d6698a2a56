// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Queue implementations behind the unified [`LogQueue`] contract.
//!
//! [`MemQueue`] is the pure in-memory FIFO. [`DiskQueue`] is the hybrid:
//! a front cache feeding consumers, the disk ring in the middle, and a
//! flow-control window that catches overflow from producers which asked
//! for back-pressure. Records written to disk are acknowledged at the
//! write, after which the disk is responsible for them; records held in memory
//! keep their ack until the consumer confirms delivery via
//! `ack_backlog`.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use log_event::{AckOutcome, LogMessage, PathOptions};

use crate::qdisk::{QDisk, QDiskError, QDiskOptions};
use crate::serialize;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Disk(#[from] QDiskError),
}

/// One queued message with the path state it travelled with.
#[derive(Clone)]
pub struct QueueItem {
    pub msg: LogMessage,
    pub ack_needed: bool,
    pub flow_control_requested: bool,
}

impl QueueItem {
    fn new(msg: LogMessage, path_options: &PathOptions<'_>) -> QueueItem {
        QueueItem {
            msg,
            ack_needed: path_options.ack_needed,
            flow_control_requested: path_options.flow_control_requested,
        }
    }

    fn ack(&self, outcome: AckOutcome) {
        if self.ack_needed {
            self.msg.ack(&PathOptions::with_ack(), outcome);
        }
    }

    fn size(&self) -> usize {
        self.msg.memory_usage()
    }
}

/// The unified queue contract shared by memory and disk queues.
pub trait LogQueue: Send {
    /// Append a message; `false` means it was not accepted (dropped, or,
    /// for a reliable queue under flow control, refused for retry).
    fn push_tail(&mut self, msg: LogMessage, path_options: &PathOptions<'_>) -> bool;

    /// Pop the next message, moving it to the backlog for possible
    /// rewind.
    fn pop_head(&mut self) -> Option<QueueItem>;

    /// Read the head without consuming it.
    fn peek_head(&mut self) -> Option<LogMessage>;

    /// Release the oldest `n` backlog entries; their acks propagate.
    fn ack_backlog(&mut self, n: usize);

    /// Put the newest `n` backlog entries back to the head for
    /// re-delivery.
    fn rewind_backlog(&mut self, n: usize);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dropped(&self) -> u64;

    /// Bytes of RAM held by in-memory copies (front cache, window,
    /// backlog).
    fn memory_usage_bytes(&self) -> usize;

    /// Flush state for shutdown; returns whether anything is persisted.
    fn stop(&mut self) -> bool;
}

fn throttled_full_warning(queue_kind: &str, dropped: u64) {
    static LAST_SEC: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let last = LAST_SEC.load(Ordering::Relaxed);
    if last != now
        && LAST_SEC
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    {
        tracing::warn!(queue_kind, dropped, "queue full, dropping messages");
    }
}

// ---------------------------------------------------------------------
// memory queue
// ---------------------------------------------------------------------

/// Plain in-memory FIFO with backlog and rewind.
///
/// Producers that requested flow control are never dropped; the queue
/// grows past its nominal capacity instead and the producer is expected
/// to suspend until acks drain it.
pub struct MemQueue {
    queue: VecDeque<QueueItem>,
    backlog: VecDeque<QueueItem>,
    capacity: usize,
    mem_bytes: usize,
    dropped: u64,
}

impl MemQueue {
    pub fn new(capacity: usize) -> MemQueue {
        MemQueue {
            queue: VecDeque::new(),
            backlog: VecDeque::new(),
            capacity,
            mem_bytes: 0,
            dropped: 0,
        }
    }
}

impl LogQueue for MemQueue {
    fn push_tail(&mut self, msg: LogMessage, path_options: &PathOptions<'_>) -> bool {
        msg.write_protect();
        if self.queue.len() >= self.capacity && !path_options.flow_control_requested {
            self.dropped += 1;
            throttled_full_warning("memory", self.dropped);
            msg.ack(path_options, AckOutcome::Processed);
            return false;
        }
        let item = QueueItem::new(msg, path_options);
        self.mem_bytes += item.size();
        self.queue.push_back(item);
        true
    }

    fn pop_head(&mut self) -> Option<QueueItem> {
        let item = self.queue.pop_front()?;
        self.backlog.push_back(item.clone());
        Some(item)
    }

    fn peek_head(&mut self) -> Option<LogMessage> {
        self.queue.front().map(|item| LogMessage::clone(&item.msg))
    }

    fn ack_backlog(&mut self, n: usize) {
        for _ in 0..n {
            let Some(item) = self.backlog.pop_front() else {
                break;
            };
            self.mem_bytes = self.mem_bytes.saturating_sub(item.size());
            item.ack(AckOutcome::Processed);
        }
    }

    fn rewind_backlog(&mut self, n: usize) {
        let n = n.min(self.backlog.len());
        let tail = self.backlog.split_off(self.backlog.len() - n);
        for item in tail.into_iter().rev() {
            self.queue.push_front(item);
        }
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn dropped(&self) -> u64 {
        self.dropped
    }

    fn memory_usage_bytes(&self) -> usize {
        self.mem_bytes
    }

    fn stop(&mut self) -> bool {
        // nothing survives a memory queue
        false
    }
}

// ---------------------------------------------------------------------
// disk-backed queue
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct DiskQueueOptions {
    /// Reliable queues persist before accepting; non-reliable ones use
    /// the front cache while the disk is empty.
    pub reliable: bool,
    pub disk: QDiskOptions,
    /// Entries the front cache may hold (forced 0 for reliable queues).
    pub front_cache_size: usize,
    /// Entries the flow-control window may hold.
    pub window_size: usize,
}

impl Default for DiskQueueOptions {
    fn default() -> Self {
        DiskQueueOptions {
            reliable: false,
            disk: QDiskOptions::default(),
            front_cache_size: 1000,
            window_size: 1000,
        }
    }
}

enum BacklogEntry {
    /// Popped from a memory tier (front cache or a disk record already
    /// decoded); rewinds go back to the front cache.
    Front(QueueItem),
    /// Popped from the flow-control window; rewinds go back there.
    Window(QueueItem),
    /// Still on disk (reliable); rewinds step the disk read head back.
    Disk,
}

/// Hybrid memory+disk queue; see the module docs for the tier rules.
pub struct DiskQueue {
    front_cache: VecDeque<QueueItem>,
    window: VecDeque<QueueItem>,
    backlog: VecDeque<BacklogEntry>,
    disk: QDisk,
    opts: DiskQueueOptions,
    mem_bytes: usize,
    /// Set when the ring reported corruption; disk tiers are bypassed.
    disk_broken: bool,
}

impl DiskQueue {
    /// Open or create the queue file; replays a previous run's state.
    pub fn start(path: &Path, mut opts: DiskQueueOptions) -> Result<DiskQueue, QueueError> {
        if opts.reliable {
            opts.front_cache_size = 0;
        }
        let disk = QDisk::start(path, opts.reliable, opts.disk)?;
        Ok(DiskQueue {
            front_cache: VecDeque::new(),
            window: VecDeque::new(),
            backlog: VecDeque::new(),
            disk,
            opts,
            mem_bytes: 0,
            disk_broken: false,
        })
    }

    fn can_use_front_cache(&self) -> bool {
        self.front_cache_has_room() && self.window.is_empty()
    }

    /// Eligibility for records already ahead of the window in FIFO
    /// order (the window's own head during rebalancing).
    fn front_cache_has_room(&self) -> bool {
        self.opts.front_cache_size > 0
            && self.front_cache.len() < self.opts.front_cache_size
            && self.disk.is_empty()
    }

    fn write_to_disk(&mut self, msg: &LogMessage) -> bool {
        if self.disk_broken {
            return false;
        }
        let mut buf = BytesMut::new();
        serialize::encode_record(msg, &mut buf);
        match self.disk.push(&buf) {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::error!(%err, "queue file failed, disk tier disabled");
                self.disk_broken = true;
                false
            }
        }
    }

    fn decode_from_disk(&mut self, body: Vec<u8>) -> Option<QueueItem> {
        match serialize::decode_record(&body) {
            Ok(record) => Some(QueueItem {
                msg: record.into_message(),
                ack_needed: false,
                flow_control_requested: false,
            }),
            Err(err) => {
                tracing::error!(%err, "corrupt record in queue file, skipped");
                self.disk.note_dropped();
                None
            }
        }
    }

    fn pop_disk(&mut self) -> Option<QueueItem> {
        if self.disk_broken {
            return None;
        }
        loop {
            match self.disk.pop() {
                Ok(Some(body)) => match self.decode_from_disk(body) {
                    Some(item) => return Some(item),
                    None => continue,
                },
                Ok(None) => return None,
                Err(err) => {
                    tracing::error!(%err, "queue file failed, disk tier disabled");
                    self.disk_broken = true;
                    return None;
                }
            }
        }
    }

    /// Restore tier order after pops freed space: the window drains to
    /// disk (or straight to the front cache when the disk is empty), and
    /// the front cache prefetches from disk.
    fn rebalance(&mut self) {
        while let Some(item) = self.window.front() {
            if self.front_cache_has_room() {
                let item = self.window.pop_front().expect("front() was Some");
                // leaving the window releases the suspended producer
                item.ack(AckOutcome::Processed);
                self.front_cache.push_back(QueueItem {
                    ack_needed: false,
                    ..item
                });
            } else if !self.disk_broken && self.disk.has_space(item.size()) {
                let item = self.window.pop_front().expect("front() was Some");
                if self.write_to_disk(&item.msg) {
                    self.mem_bytes = self.mem_bytes.saturating_sub(item.size());
                    item.ack(AckOutcome::Processed);
                } else {
                    self.window.push_front(item);
                    break;
                }
            } else {
                break;
            }
        }

        if self.front_cache.is_empty() && self.opts.front_cache_size > 0 {
            while self.front_cache.len() < self.opts.front_cache_size {
                let Some(item) = self.pop_disk() else {
                    break;
                };
                self.mem_bytes += item.size();
                self.front_cache.push_back(item);
                // decoded records were acked at the disk write; the ring
                // slot is released right away for non-reliable files
            }
        }
    }
}

impl LogQueue for DiskQueue {
    fn push_tail(&mut self, msg: LogMessage, path_options: &PathOptions<'_>) -> bool {
        msg.write_protect();

        if !self.opts.reliable && self.can_use_front_cache() {
            let item = QueueItem::new(msg, path_options);
            self.mem_bytes += item.size();
            self.front_cache.push_back(item);
            return true;
        }

        if self.window.is_empty() && self.write_to_disk(&msg) {
            // the disk owns it now; release the producer
            msg.ack(path_options, AckOutcome::Processed);
            return true;
        }

        if path_options.flow_control_requested && self.window.len() < self.opts.window_size {
            let item = QueueItem::new(msg, path_options);
            self.mem_bytes += item.size();
            self.window.push_back(item);
            return true;
        }

        self.disk.note_dropped();
        throttled_full_warning(
            if self.opts.reliable {
                "disk-reliable"
            } else {
                "disk"
            },
            self.disk.dropped(),
        );
        msg.ack(path_options, AckOutcome::Processed);
        false
    }

    fn pop_head(&mut self) -> Option<QueueItem> {
        self.rebalance();

        if let Some(item) = self.front_cache.pop_front() {
            self.backlog.push_back(BacklogEntry::Front(item.clone()));
            return Some(item);
        }
        if let Some(item) = self.pop_disk() {
            if self.opts.reliable {
                self.backlog.push_back(BacklogEntry::Disk);
            } else {
                // the ring slot is already released; keep the decoded
                // record in the memory backlog for rewind
                self.mem_bytes += item.size();
                self.backlog.push_back(BacklogEntry::Front(item.clone()));
            }
            return Some(item);
        }
        if let Some(item) = self.window.pop_front() {
            self.backlog.push_back(BacklogEntry::Window(item.clone()));
            return Some(item);
        }
        None
    }

    fn peek_head(&mut self) -> Option<LogMessage> {
        self.rebalance();
        if let Some(item) = self.front_cache.front() {
            return Some(LogMessage::clone(&item.msg));
        }
        if !self.disk_broken {
            if let Ok(Some(body)) = self.disk.peek() {
                if let Ok(record) = serialize::decode_record(&body) {
                    return Some(record.into_message());
                }
            }
        }
        self.window.front().map(|item| LogMessage::clone(&item.msg))
    }

    fn ack_backlog(&mut self, n: usize) {
        for _ in 0..n {
            match self.backlog.pop_front() {
                Some(BacklogEntry::Front(item)) | Some(BacklogEntry::Window(item)) => {
                    self.mem_bytes = self.mem_bytes.saturating_sub(item.size());
                    item.ack(AckOutcome::Processed);
                }
                Some(BacklogEntry::Disk) => {
                    if let Err(err) = self.disk.ack_backlog(1) {
                        tracing::error!(%err, "queue file ack failed");
                    }
                }
                None => break,
            }
        }
    }

    fn rewind_backlog(&mut self, n: usize) {
        let n = n.min(self.backlog.len());
        let tail = self.backlog.split_off(self.backlog.len() - n);
        for entry in tail.into_iter().rev() {
            match entry {
                BacklogEntry::Front(item) => self.front_cache.push_front(item),
                BacklogEntry::Window(item) => self.window.push_front(item),
                BacklogEntry::Disk => {
                    self.disk.rewind_backlog(1);
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.front_cache.len() + self.disk.len() as usize + self.window.len()
    }

    fn dropped(&self) -> u64 {
        self.disk.dropped()
    }

    fn memory_usage_bytes(&self) -> usize {
        self.mem_bytes
    }

    /// Fold every in-memory segment back into the ring, in delivery
    /// order (unacked backlog first), so a restart resumes without loss.
    fn stop(&mut self) -> bool {
        let mut records: Vec<Vec<u8>> = Vec::new();
        let mut encode = |msg: &LogMessage| {
            let mut buf = BytesMut::new();
            serialize::encode_record(msg, &mut buf);
            buf.to_vec()
        };

        let disk_records = if self.disk_broken {
            Vec::new()
        } else {
            self.disk.drain_all().unwrap_or_else(|err| {
                tracing::error!(%err, "queue file unreadable at shutdown");
                Vec::new()
            })
        };
        let mut disk_records = disk_records.into_iter();
        let disk_backlog: Vec<Vec<u8>> = self
            .backlog
            .iter()
            .filter(|e| matches!(e, BacklogEntry::Disk))
            .map(|_| disk_records.next().unwrap_or_default())
            .collect();
        let mut disk_backlog = disk_backlog.into_iter();

        for entry in self.backlog.drain(..) {
            match entry {
                BacklogEntry::Front(item) | BacklogEntry::Window(item) => {
                    records.push(encode(&item.msg));
                    item.ack(AckOutcome::Processed);
                }
                BacklogEntry::Disk => {
                    if let Some(body) = disk_backlog.next() {
                        records.push(body);
                    }
                }
            }
        }
        for item in self.front_cache.drain(..) {
            records.push(encode(&item.msg));
            item.ack(AckOutcome::Processed);
        }
        records.extend(disk_records);
        for item in self.window.drain(..) {
            records.push(encode(&item.msg));
            item.ack(AckOutcome::Processed);
        }
        self.mem_bytes = 0;

        if self.disk_broken {
            return false;
        }
        match self.disk.rebuild(&records) {
            Ok(kept) => {
                let _ = self.disk.stop();
                kept > 0
            }
            Err(err) => {
                tracing::error!(%err, "failed to persist queue at shutdown");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log_event::LogRecord;

    fn message(i: u32) -> LogMessage {
        let mut record = LogRecord::new_empty();
        record.seq_num = i;
        record.set_value(
            log_event::builtin::MESSAGE,
            format!("message {i}").as_bytes(),
            log_event::ValueType::String,
        );
        record.into_message()
    }

    #[test]
    fn mem_queue_fifo_and_drop_accounting() {
        let mut queue = MemQueue::new(2);
        let no_fc = PathOptions::default();
        assert!(queue.push_tail(message(0), &no_fc));
        assert!(queue.push_tail(message(1), &no_fc));
        assert!(!queue.push_tail(message(2), &no_fc));
        assert_eq!(queue.dropped(), 1);

        // flow control overrides the cap
        let fc = PathOptions {
            flow_control_requested: true,
            ..Default::default()
        };
        assert!(queue.push_tail(message(3), &fc));

        assert_eq!(queue.pop_head().unwrap().msg.seq_num, 0);
        assert_eq!(queue.pop_head().unwrap().msg.seq_num, 1);
        assert_eq!(queue.pop_head().unwrap().msg.seq_num, 3);
    }

    #[test]
    fn mem_queue_rewind_redelivers_in_order() {
        let mut queue = MemQueue::new(10);
        for i in 0..5 {
            queue.push_tail(message(i), &PathOptions::default());
        }
        let popped: Vec<u32> = (0..5).map(|_| queue.pop_head().unwrap().msg.seq_num).collect();
        assert_eq!(popped, vec![0, 1, 2, 3, 4]);

        queue.rewind_backlog(2);
        assert_eq!(queue.pop_head().unwrap().msg.seq_num, 3);
        assert_eq!(queue.pop_head().unwrap().msg.seq_num, 4);
    }
}
