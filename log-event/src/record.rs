// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The copy-on-write event record.
//!
//! A [`LogRecord`] owns one name-value table plus tags, structured-data
//! index, timestamps and addressing. Records are shared between pipeline
//! branches as [`LogMessage`] (`Arc<LogRecord>`); before publication a
//! record is write-protected and every later mutation goes through
//! [`LogRecord::make_writable`], which clones the record while still
//! sharing the heavy sub-fields until their first write.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::ack::AckCallback;
use crate::nvtable::NvTable;
use crate::registry::{self, builtin, NVHandle};
use crate::tags::{self, TagId, TagSet};
use crate::timestamp::{StampKind, UnixTime};
use crate::value::ValueType;

/// Shared handle to a record.
pub type LogMessage = Arc<LogRecord>;

/// Record flags.
pub mod lf {
    /// The message was generated on this host.
    pub const LOCAL: u32 = 0x0001;
    /// The message was generated by the engine itself.
    pub const INTERNAL: u32 = 0x0002;
    /// Periodic mark message.
    pub const MARK: u32 = 0x0004;
    /// The payload has been validated as UTF-8.
    pub const UTF8: u32 = 0x0008;
}

/// Per-traversal metadata accompanying every `queue()` call; never stored
/// in the record itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathOptions<'a> {
    /// The source wants a delivery callback; ack bookkeeping is skipped
    /// entirely when unset.
    pub ack_needed: bool,
    /// The producer can be suspended, so full queues may hold the message
    /// in their flow-control window instead of dropping it.
    pub flow_control_requested: bool,
    /// Filter expressions flag a match here for the enclosing junction.
    pub matched: Option<&'a AtomicBool>,
}

impl<'a> PathOptions<'a> {
    pub fn with_ack() -> PathOptions<'static> {
        PathOptions {
            ack_needed: true,
            ..Default::default()
        }
    }
}

fn next_rcpt_id() -> u64 {
    static RCPT_ID: AtomicU64 = AtomicU64::new(1);
    RCPT_ID.fetch_add(1, Ordering::Relaxed)
}

/// One parsed log/event record.
pub struct LogRecord {
    /// Packed {ack_cnt, abort, suspend}; see the `ack` module for layout.
    pub(crate) ack_and_flags: AtomicU32,
    pub(crate) write_protected: AtomicBool,

    pub flags: u32,
    pub pri: u16,
    /// IP protocol that delivered the datagram carrying this record.
    pub proto: u8,

    pub(crate) payload: Arc<NvTable>,
    pub(crate) tags: Arc<TagSet>,
    /// Handles of `.SDATA.*` entries, same-block runs kept contiguous.
    pub(crate) sdata: Arc<Vec<NVHandle>>,

    pub saddr: Option<SocketAddr>,
    pub daddr: Option<SocketAddr>,

    stamps: [UnixTime; 3],

    pub host_id: u32,
    pub rcpt_id: u64,
    pub seq_num: u32,
    pub recvd_rawmsg_size: u32,

    num_matches: u16,
    generation: u16,

    pub(crate) original: Option<LogMessage>,
    pub(crate) ack_callback: Option<AckCallback>,
}

impl LogRecord {
    fn alloc(payload_hint: usize) -> LogRecord {
        LogRecord {
            ack_and_flags: AtomicU32::new(0),
            write_protected: AtomicBool::new(false),
            flags: 0,
            pri: 0,
            proto: 0,
            payload: Arc::new(NvTable::new(payload_hint)),
            tags: Arc::new(TagSet::default()),
            sdata: Arc::new(Vec::new()),
            saddr: None,
            daddr: None,
            stamps: [UnixTime::default(); 3],
            host_id: 0,
            rcpt_id: next_rcpt_id(),
            seq_num: 0,
            recvd_rawmsg_size: 0,
            num_matches: 0,
            generation: 0,
            original: None,
            ack_callback: None,
        }
    }

    pub fn new_sized(payload_hint: usize) -> LogRecord {
        let mut record = LogRecord::alloc(payload_hint);
        let now = UnixTime::now();
        record.stamps[StampKind::Received as usize] = now;
        record.stamps[StampKind::Message as usize] = now;
        record
    }

    pub fn new_empty() -> LogRecord {
        LogRecord::new_sized(256)
    }

    /// A record considered local to this host.
    pub fn new_local() -> LogRecord {
        let mut record = LogRecord::new_empty();
        record.flags |= lf::LOCAL;
        record
    }

    /// A record originating from the engine itself.
    pub fn new_internal(pri: u16, text: &str) -> LogRecord {
        let mut record = LogRecord::new_local();
        record.flags |= lf::INTERNAL;
        record.set_value(builtin::PROGRAM, b"logpiped", ValueType::String);
        record.set_value(
            builtin::PID,
            std::process::id().to_string().as_bytes(),
            ValueType::String,
        );
        record.set_value(builtin::MESSAGE, text.as_bytes(), ValueType::String);
        record.pri = pri;
        record
    }

    /// The periodic `-- MARK --` record.
    pub fn new_mark() -> LogRecord {
        let mut record = LogRecord::new_local();
        record.set_value(builtin::MESSAGE, b"-- MARK --", ValueType::String);
        record.pri = 5 << 3 | 6; // syslog facility, informational
        record.flags |= lf::MARK | lf::INTERNAL;
        record
    }

    pub fn into_message(self) -> LogMessage {
        Arc::new(self)
    }

    pub fn is_write_protected(&self) -> bool {
        self.write_protected.load(Ordering::Acquire)
    }

    /// Freeze the record before publishing it to additional readers.
    pub fn write_protect(&self) {
        self.write_protected.store(true, Ordering::Release);
    }

    /// Obtain a mutable view, cloning copy-on-write when the record is
    /// write-protected or shared.
    pub fn make_writable<'a>(
        msg: &'a mut LogMessage,
        path_options: &PathOptions<'_>,
    ) -> &'a mut LogRecord {
        if msg.is_write_protected() || Arc::get_mut(msg).is_none() {
            let parent = Arc::clone(msg);
            *msg = LogRecord::clone_cow(&parent, path_options);
            // the clone replaces the parent in this traversal; release the
            // unit we consumed, the child forwards its own on completion
            parent.ack(path_options, crate::ack::AckOutcome::Processed);
        }
        Arc::get_mut(msg).expect("freshly cloned record is uniquely owned")
    }

    /// Clone for a pipeline branch: the parent is frozen, its ack count
    /// grows by one when the path needs acking, and the child shares every
    /// heavy sub-field until its first write.
    pub fn clone_cow(msg: &LogMessage, path_options: &PathOptions<'_>) -> LogMessage {
        msg.write_protect();
        let child = LogRecord {
            ack_and_flags: AtomicU32::new(0),
            write_protected: AtomicBool::new(false),
            flags: msg.flags,
            pri: msg.pri,
            proto: msg.proto,
            payload: Arc::clone(&msg.payload),
            tags: Arc::clone(&msg.tags),
            sdata: Arc::clone(&msg.sdata),
            saddr: msg.saddr,
            daddr: msg.daddr,
            stamps: msg.stamps,
            host_id: msg.host_id,
            rcpt_id: msg.rcpt_id,
            seq_num: msg.seq_num,
            recvd_rawmsg_size: msg.recvd_rawmsg_size,
            num_matches: msg.num_matches,
            generation: msg.generation,
            original: Some(Arc::clone(msg)),
            ack_callback: None,
        };
        if path_options.ack_needed {
            msg.add_ack(path_options);
            child.add_ack(path_options);
        }
        tracing::trace!(rcpt_id = msg.rcpt_id, "message cloned");
        Arc::new(child)
    }

    pub fn set_ack_callback(&mut self, callback: AckCallback) {
        self.ack_callback = Some(callback);
    }

    // -- values ---------------------------------------------------------

    pub fn set_value(&mut self, handle: NVHandle, value: &[u8], ty: ValueType) {
        debug_assert!(
            !self.is_write_protected(),
            "attempt to modify a write-protected record"
        );
        if handle == builtin::PROGRAM || handle == builtin::PID {
            // a rebuilt header would no longer match
            Arc::make_mut(&mut self.payload).unset(builtin::LEGACY_MSGHDR);
        }
        if let Some((flags, index)) = registry::handle_flags_of(handle) {
            if flags & registry::handle_flags::MATCH != 0 {
                self.extend_matches(index);
            }
        }
        match Arc::make_mut(&mut self.payload).set(handle, value, ty) {
            Ok(outcome) => {
                if outcome.inserted_new_entry && registry::is_sdata(handle) {
                    self.sdata_insert(handle);
                }
            }
            Err(err) => report_dropped_write(handle, &err),
        }
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn set_value_by_name(&mut self, name: &str, value: &[u8], ty: ValueType) {
        match registry::get_handle(name) {
            Ok(handle) => self.set_value(handle, value, ty),
            Err(err) => tracing::error!(name, %err, "rejected value name"),
        }
    }

    pub fn set_value_indirect(
        &mut self,
        handle: NVHandle,
        target: NVHandle,
        ofs: u32,
        len: u32,
        ty: ValueType,
    ) {
        debug_assert!(
            !self.is_write_protected(),
            "attempt to modify a write-protected record"
        );
        match Arc::make_mut(&mut self.payload).set_indirect(handle, target, ofs, len, ty) {
            Ok(outcome) => {
                if outcome.inserted_new_entry && registry::is_sdata(handle) {
                    self.sdata_insert(handle);
                }
            }
            Err(err) => report_dropped_write(handle, &err),
        }
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn get_value(&self, handle: NVHandle) -> Option<(&[u8], ValueType)> {
        self.payload.get(handle)
    }

    pub fn get_value_by_name(&self, name: &str) -> Option<(&[u8], ValueType)> {
        self.payload.get(registry::get_handle(name).ok()?)
    }

    pub fn unset_value(&mut self, handle: NVHandle) {
        debug_assert!(
            !self.is_write_protected(),
            "attempt to modify a write-protected record"
        );
        Arc::make_mut(&mut self.payload).unset(handle);
        if registry::is_sdata(handle) {
            Arc::make_mut(&mut self.sdata).retain(|h| *h != handle);
        }
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn values_foreach(&self, f: impl FnMut(NVHandle, &str, &[u8], ValueType)) {
        self.payload.foreach(f);
    }

    // -- match captures -------------------------------------------------

    pub fn set_match(&mut self, index: u8, value: &[u8], ty: ValueType) {
        self.set_value(registry::match_handle(index), value, ty);
    }

    pub fn get_match(&self, index: u8) -> Option<(&[u8], ValueType)> {
        self.get_value(registry::match_handle(index))
    }

    pub fn num_matches(&self) -> u16 {
        self.num_matches
    }

    /// Restore the match-capture space of a reloaded record to `count`
    /// captures; captures without a stored value stay unset.
    pub fn extend_match_space(&mut self, count: u16) {
        if count > 0 {
            self.extend_matches((count - 1).min(255) as u8);
        }
    }

    /// Setting `$n` extends the match space; intermediate captures that
    /// were never set are explicitly unset so stale values cannot leak in.
    fn extend_matches(&mut self, index: u8) {
        let wanted = index as u16 + 1;
        if wanted <= self.num_matches {
            return;
        }
        let payload = Arc::make_mut(&mut self.payload);
        for i in self.num_matches..index as u16 {
            payload.unset(registry::match_handle(i as u8));
        }
        self.num_matches = wanted;
    }

    // -- tags -----------------------------------------------------------

    pub fn set_tag(&mut self, id: TagId) {
        debug_assert!(!self.is_write_protected());
        Arc::make_mut(&mut self.tags).set(id);
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn set_tag_by_name(&mut self, name: &str) {
        self.set_tag(tags::get_tag_id(name));
    }

    pub fn clear_tag(&mut self, id: TagId) {
        debug_assert!(!self.is_write_protected());
        Arc::make_mut(&mut self.tags).clear(id);
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn has_tag(&self, id: TagId) -> bool {
        self.tags.is_set(id)
    }

    pub fn tags_foreach(&self, f: impl FnMut(TagId, &str)) {
        self.tags.foreach(f);
    }

    // -- structured data ------------------------------------------------

    pub fn sdata_handles(&self) -> &[NVHandle] {
        &self.sdata
    }

    fn sdata_insert(&mut self, handle: NVHandle) {
        let prefix = registry::sdata_prefix_of(handle).unwrap_or_default();
        let sdata = Arc::make_mut(&mut self.sdata);
        if sdata.contains(&handle) {
            return;
        }
        // keep entries of one block contiguous; new blocks append at the end
        let pos = sdata
            .iter()
            .rposition(|h| registry::sdata_prefix_of(*h).as_deref() == Some(prefix.as_str()))
            .map(|i| i + 1)
            .unwrap_or(sdata.len());
        sdata.insert(pos, handle);
    }

    // -- timestamps & addressing ---------------------------------------

    pub fn stamp(&self, kind: StampKind) -> &UnixTime {
        &self.stamps[kind as usize]
    }

    pub fn set_timestamp(&mut self, kind: StampKind, time: UnixTime) {
        debug_assert!(!self.is_write_protected());
        self.stamps[kind as usize] = time;
    }

    pub fn set_source_addr(&mut self, addr: SocketAddr) {
        debug_assert!(!self.is_write_protected());
        self.saddr = Some(addr);
    }

    pub fn set_dest_addr(&mut self, addr: SocketAddr) {
        debug_assert!(!self.is_write_protected());
        self.daddr = Some(addr);
    }

    pub fn generation(&self) -> u16 {
        self.generation
    }

    /// Bytes of RAM attributable to this record, counted by queues.
    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.payload.memory_usage()
            + self.tags.memory_usage()
            + self.sdata.capacity() * std::mem::size_of::<NVHandle>()
    }
}

impl std::fmt::Debug for LogRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogRecord")
            .field("rcpt_id", &self.rcpt_id)
            .field("pri", &self.pri)
            .field("flags", &self.flags)
            .field("generation", &self.generation)
            .field("write_protected", &self.is_write_protected())
            .field("pending_acks", &self.pending_acks())
            .finish_non_exhaustive()
    }
}

fn report_dropped_write(handle: NVHandle, err: &crate::nvtable::NvTableError) {
    // once-per-second throttle, the path can fire for every event
    static LAST_SEC: AtomicU64 = AtomicU64::new(0);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let last = LAST_SEC.load(Ordering::Relaxed);
    if last != now
        && LAST_SEC
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    {
        tracing::error!(
            name = registry::name_of(handle).unwrap_or_default(),
            %err,
            "value dropped"
        );
    }
}
