// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Self-describing wire form of one event record.
//!
//! Values and tags are keyed by name, never by handle: a persisted queue
//! may be read back by a process with a different registry layout, so
//! handles are re-mapped through the current registry on load. Unknown
//! names simply register fresh handles; an indirect entry whose referent
//! did not survive is dropped with a warning.
//!
//! Layout (all little-endian): `u8 version`, `u8 flags`, then record
//! flags u32, pri u16, proto u8, host_id u32, rcpt_id u64, seq_num u32,
//! three timestamps (sec u64, usec u32, gmtoff i32 with `i32::MIN` for
//! unset), tag names, then the name-value entries.

use bytes::{Buf, BufMut, BytesMut};
use log_event::timestamp::StampKind;
use log_event::{registry, LogRecord, UnixTime, ValueType};

/// Bump when the payload layout changes.
pub const RECORD_VERSION: u8 = 1;

const GMTOFF_UNSET: i32 = i32::MIN;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SerializeError {
    #[error("record truncated")]
    Truncated,
    #[error("unsupported record version {0}")]
    BadVersion(u8),
    #[error("invalid value type tag {0}")]
    BadValueType(u8),
    #[error("malformed string field")]
    BadString,
}

/// Encode `msg` into `buf` (version byte onward, no length prefix; the
/// disk layer frames records).
pub fn encode_record(msg: &LogRecord, buf: &mut BytesMut) {
    buf.put_u8(RECORD_VERSION);
    buf.put_u8(0); // reserved flags
    buf.put_u32_le(msg.flags);
    buf.put_u16_le(msg.pri);
    buf.put_u8(msg.proto);
    buf.put_u32_le(msg.host_id);
    buf.put_u64_le(msg.rcpt_id);
    buf.put_u32_le(msg.seq_num);
    buf.put_u8(msg.num_matches().min(255) as u8);

    for kind in [StampKind::Received, StampKind::Message, StampKind::Processed] {
        let stamp = msg.stamp(kind);
        buf.put_u64_le(stamp.ut_sec as u64);
        buf.put_u32_le(stamp.ut_usec);
        buf.put_i32_le(stamp.ut_gmtoff.unwrap_or(GMTOFF_UNSET));
    }

    let mut tag_names: Vec<String> = Vec::new();
    msg.tags_foreach(|_, name| tag_names.push(name.to_string()));
    buf.put_u16_le(tag_names.len() as u16);
    for name in &tag_names {
        put_str(buf, name);
    }

    let mut count: u16 = 0;
    let mut entries = BytesMut::new();
    msg.values_foreach(|_, name, value, ty| {
        put_str(&mut entries, name);
        entries.put_u8(ty as u8);
        entries.put_u8(1); // direct; aliases are flattened on write
        entries.put_u32_le(value.len() as u32);
        entries.put_slice(value);
        count += 1;
    });
    buf.put_u16_le(count);
    buf.extend_from_slice(&entries);
}

/// Decode one record previously produced by [`encode_record`].
///
/// The returned record keeps its persisted `rcpt_id`; names are re-mapped
/// through the live registry.
pub fn decode_record(mut buf: &[u8]) -> Result<LogRecord, SerializeError> {
    let version = get_u8(&mut buf)?;
    if version != RECORD_VERSION {
        return Err(SerializeError::BadVersion(version));
    }
    let _flags = get_u8(&mut buf)?;

    let mut record = LogRecord::new_empty();
    record.flags = get_u32(&mut buf)?;
    record.pri = get_u16(&mut buf)?;
    record.proto = get_u8(&mut buf)?;
    record.host_id = get_u32(&mut buf)?;
    record.rcpt_id = get_u64(&mut buf)?;
    record.seq_num = get_u32(&mut buf)?;
    let num_matches = get_u8(&mut buf)?;
    // the stored entries only cover captures that held a value; the
    // extension also unsets the gaps in between
    record.extend_match_space(num_matches as u16);

    for kind in [StampKind::Received, StampKind::Message, StampKind::Processed] {
        let sec = get_u64(&mut buf)? as i64;
        let usec = get_u32(&mut buf)?;
        let gmtoff = get_i32(&mut buf)?;
        record.set_timestamp(
            kind,
            UnixTime::from_unix(
                sec,
                usec,
                (gmtoff != GMTOFF_UNSET).then_some(gmtoff),
            ),
        );
    }

    let tag_count = get_u16(&mut buf)?;
    for _ in 0..tag_count {
        let name = get_str(&mut buf)?;
        record.set_tag_by_name(&name);
    }

    let entry_count = get_u16(&mut buf)?;
    for _ in 0..entry_count {
        let name = get_str(&mut buf)?;
        let ty_raw = get_u8(&mut buf)?;
        let ty = ValueType::from_u8(ty_raw).ok_or(SerializeError::BadValueType(ty_raw))?;
        let direct = get_u8(&mut buf)? != 0;
        if direct {
            let len = get_u32(&mut buf)? as usize;
            if buf.remaining() < len {
                return Err(SerializeError::Truncated);
            }
            let value = buf.copy_to_bytes(len);
            record.set_value_by_name(&name, &value, ty);
        } else {
            // indirect entries reference by name; a missing referent
            // cannot be repaired, the row is dropped
            let ref_name = get_str(&mut buf)?;
            let ofs = get_u32(&mut buf)?;
            let len = get_u32(&mut buf)?;
            match (registry::get_handle(&name), registry::get_handle(&ref_name)) {
                (Ok(handle), Ok(target)) if record.get_value(target).is_some() => {
                    record.set_value_indirect(handle, target, ofs, len, ty);
                }
                _ => {
                    tracing::warn!(name, ref_name, "dropping dangling indirect entry on load");
                }
            }
        }
    }

    Ok(record)
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut &[u8]) -> Result<String, SerializeError> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(SerializeError::Truncated);
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| SerializeError::BadString)
}

macro_rules! get_impl {
    ($name:ident, $ty:ty, $get:ident, $size:expr) => {
        fn $name(buf: &mut &[u8]) -> Result<$ty, SerializeError> {
            if buf.remaining() < $size {
                return Err(SerializeError::Truncated);
            }
            Ok(buf.$get())
        }
    };
}

get_impl!(get_u8, u8, get_u8, 1);
get_impl!(get_u16, u16, get_u16_le, 2);
get_impl!(get_u32, u32, get_u32_le, 4);
get_impl!(get_u64, u64, get_u64_le, 8);
get_impl!(get_i32, i32, get_i32_le, 4);

#[cfg(test)]
mod tests {
    use super::*;
    use log_event::{builtin, get_tag_id};

    fn sample() -> LogRecord {
        let mut record = LogRecord::new_empty();
        record.pri = 165;
        record.proto = 6;
        record.host_id = 0xdead;
        record.seq_num = 7;
        record.set_value(builtin::HOST, b"web-1", ValueType::String);
        record.set_value(builtin::MESSAGE, b"payload text", ValueType::String);
        record.set_value_by_name("custom.key", b"42", ValueType::Integer);
        record.set_tag_by_name("serialize.test.tag");
        record.set_timestamp(
            StampKind::Message,
            UnixTime::from_unix(1710074096, 789000, Some(3600)),
        );
        record
    }

    #[test]
    fn round_trip_preserves_fields() {
        let original = sample();
        let mut buf = BytesMut::new();
        encode_record(&original, &mut buf);
        let restored = decode_record(&buf).unwrap();

        assert_eq!(restored.pri, original.pri);
        assert_eq!(restored.proto, original.proto);
        assert_eq!(restored.host_id, original.host_id);
        assert_eq!(restored.rcpt_id, original.rcpt_id);
        assert_eq!(restored.seq_num, original.seq_num);
        assert_eq!(
            restored.get_value(builtin::HOST),
            Some((&b"web-1"[..], ValueType::String))
        );
        assert_eq!(
            restored.get_value_by_name("custom.key"),
            Some((&b"42"[..], ValueType::Integer))
        );
        assert!(restored.has_tag(get_tag_id("serialize.test.tag")));
        let stamp = restored.stamp(StampKind::Message);
        assert_eq!(stamp.ut_sec, 1710074096);
        assert_eq!(stamp.ut_usec, 789000);
        assert_eq!(stamp.ut_gmtoff, Some(3600));
    }

    #[test]
    fn match_captures_round_trip() {
        let mut record = sample();
        record.set_match(1, b"alpha", ValueType::String);
        record.set_match(3, b"gamma", ValueType::String);
        assert_eq!(record.num_matches(), 4);

        let mut buf = BytesMut::new();
        encode_record(&record, &mut buf);
        let restored = decode_record(&buf).unwrap();

        assert_eq!(restored.num_matches(), 4);
        assert_eq!(
            restored.get_match(1),
            Some((&b"alpha"[..], ValueType::String))
        );
        assert_eq!(
            restored.get_match(3),
            Some((&b"gamma"[..], ValueType::String))
        );
        // the gap capture was never stored and stays unset
        assert_eq!(restored.get_match(2), None);
    }

    #[test]
    fn unset_gmtoff_survives() {
        let mut record = LogRecord::new_empty();
        record.set_timestamp(StampKind::Message, UnixTime::from_unix(10, 0, None));
        let mut buf = BytesMut::new();
        encode_record(&record, &mut buf);
        let restored = decode_record(&buf).unwrap();
        assert_eq!(restored.stamp(StampKind::Message).ut_gmtoff, None);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let mut buf = BytesMut::new();
        encode_record(&sample(), &mut buf);
        for cut in [0, 1, 5, buf.len() - 1] {
            assert!(decode_record(&buf[..cut]).is_err());
        }
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut buf = BytesMut::new();
        encode_record(&sample(), &mut buf);
        buf[0] = 9;
        assert_eq!(
            decode_record(&buf).unwrap_err(),
            SerializeError::BadVersion(9)
        );
    }
}
