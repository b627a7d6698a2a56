// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Built-in template macros.
//!
//! Time-based macros exist in four scopes selected by name prefix: plain
//! and `S_` use the sender's stamp, `R_` the receive time, `P_` the
//! processing time and `C_` the current wall clock. Macro names share the
//! value namespace, so they are registered with the global registry and
//! tables refuse to alias them.

use std::sync::OnceLock;
use std::time::Instant;

use chrono::{DateTime, FixedOffset, TimeZone};
use log_event::timestamp::{StampKind, UnixTime};
use log_event::{builtin, LogRecord};

use crate::template::TemplateOptions;

/// Which of the record's stamps a time macro reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeScope {
    /// Sender's claimed time (the default and the `S_` prefix).
    Stamp,
    /// Reception time (`R_`).
    Received,
    /// Delivery time (`P_`).
    Processed,
    /// Wall clock at expansion (`C_`).
    Current,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroKind {
    Date,
    IsoDate,
    FullDate,
    UnixTime,
    Stamp,
    Tz,
    TzOffset,
    Year,
    Month,
    Day,
    Hour,
    Min,
    Sec,
    Usec,
    Msec,
    WeekDay,
    MonthName,
    Host,
    Program,
    Pid,
    MsgId,
    Message,
    MsgHdr,
    Tags,
    Pri,
    Facility,
    FacilityNum,
    Severity,
    SeverityNum,
    SeqNum,
    RcptId,
    HostId,
    UniqId,
    SysUptime,
    LogHost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Macro {
    pub kind: MacroKind,
    pub scope: TimeScope,
}

const BASE_MACROS: &[(&str, MacroKind)] = &[
    ("DATE", MacroKind::Date),
    ("ISODATE", MacroKind::IsoDate),
    ("FULLDATE", MacroKind::FullDate),
    ("UNIXTIME", MacroKind::UnixTime),
    ("STAMP", MacroKind::Stamp),
    ("TZ", MacroKind::Tz),
    ("TZOFFSET", MacroKind::TzOffset),
    ("YEAR", MacroKind::Year),
    ("MONTH", MacroKind::Month),
    ("DAY", MacroKind::Day),
    ("HOUR", MacroKind::Hour),
    ("MIN", MacroKind::Min),
    ("SEC", MacroKind::Sec),
    ("USEC", MacroKind::Usec),
    ("MSEC", MacroKind::Msec),
    ("WEEK_DAY", MacroKind::WeekDay),
    ("WEEKDAY", MacroKind::WeekDay),
    ("MONTH_NAME", MacroKind::MonthName),
];

const PLAIN_MACROS: &[(&str, MacroKind)] = &[
    ("HOST", MacroKind::Host),
    ("PROGRAM", MacroKind::Program),
    ("PID", MacroKind::Pid),
    ("MSGID", MacroKind::MsgId),
    ("MESSAGE", MacroKind::Message),
    ("MSG", MacroKind::Message),
    ("MSGHDR", MacroKind::MsgHdr),
    ("TAGS", MacroKind::Tags),
    ("PRI", MacroKind::Pri),
    ("FACILITY", MacroKind::Facility),
    ("FACILITY_NUM", MacroKind::FacilityNum),
    ("SEVERITY", MacroKind::Severity),
    ("LEVEL", MacroKind::Severity),
    ("SEVERITY_NUM", MacroKind::SeverityNum),
    ("LEVEL_NUM", MacroKind::SeverityNum),
    ("SEQNUM", MacroKind::SeqNum),
    ("RCPTID", MacroKind::RcptId),
    ("HOSTID", MacroKind::HostId),
    ("UNIQID", MacroKind::UniqId),
    ("SYSUPTIME", MacroKind::SysUptime),
    ("LOGHOST", MacroKind::LogHost),
];

/// Resolve a macro name, including its optional time-scope prefix.
pub fn lookup(name: &str) -> Option<Macro> {
    let (scope, base) = match name {
        _ if name.starts_with("R_") => (TimeScope::Received, &name[2..]),
        _ if name.starts_with("S_") => (TimeScope::Stamp, &name[2..]),
        _ if name.starts_with("C_") => (TimeScope::Current, &name[2..]),
        _ if name.starts_with("P_") => (TimeScope::Processed, &name[2..]),
        _ => (TimeScope::Stamp, name),
    };
    if let Some(&(_, kind)) = BASE_MACROS.iter().find(|(n, _)| *n == base) {
        return Some(Macro { kind, scope });
    }
    // non-time macros take no scope prefix
    if base == name {
        if let Some(&(_, kind)) = PLAIN_MACROS.iter().find(|(n, _)| *n == name) {
            return Some(Macro {
                kind,
                scope: TimeScope::Stamp,
            });
        }
    }
    None
}

/// Register every macro name with the global registry so handle kind
/// checks (no aliasing of macros) hold. Idempotent.
pub fn register_all() {
    static DONE: OnceLock<()> = OnceLock::new();
    DONE.get_or_init(|| {
        let mut id: u8 = 0;
        for (name, _) in BASE_MACROS.iter().chain(PLAIN_MACROS.iter()) {
            log_event::registry::register_macro(name, id);
            id = id.wrapping_add(1);
        }
    });
}

fn process_start() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

/// Capture process start as early as possible; called from engine startup.
pub fn mark_process_start() {
    process_start();
}

fn resolve_stamp(msg: &LogRecord, scope: TimeScope) -> UnixTime {
    match scope {
        TimeScope::Stamp => *msg.stamp(StampKind::Message),
        TimeScope::Received => *msg.stamp(StampKind::Received),
        TimeScope::Processed => {
            let processed = msg.stamp(StampKind::Processed);
            if processed.is_set() {
                *processed
            } else {
                UnixTime::now()
            }
        }
        TimeScope::Current => UnixTime::now(),
    }
}

fn zoned(stamp: &UnixTime, opts: &TemplateOptions) -> DateTime<FixedOffset> {
    let gmtoff = opts.zone_override.or(stamp.ut_gmtoff).unwrap_or(0);
    let offset = FixedOffset::east_opt(gmtoff).unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
    offset
        .timestamp_opt(stamp.ut_sec, stamp.ut_usec * 1000)
        .single()
        .unwrap_or_else(|| offset.timestamp_opt(0, 0).unwrap())
}

fn append_frac(out: &mut String, usec: u32, digits: u8) {
    if digits == 0 {
        return;
    }
    let digits = digits.min(6) as usize;
    let frac = format!("{usec:06}");
    out.push('.');
    out.push_str(&frac[..digits]);
}

fn append_tzoffset(out: &mut String, gmtoff: i32) {
    let (sign, abs) = if gmtoff < 0 {
        ('-', -gmtoff)
    } else {
        ('+', gmtoff)
    };
    out.push(sign);
    out.push_str(&format!("{:02}:{:02}", abs / 3600, abs % 3600 / 60));
}

const FACILITY_NAMES: [&str; 24] = [
    "kern", "user", "mail", "daemon", "auth", "syslog", "lpr", "news", "uucp", "cron", "authpriv",
    "ftp", "ntp", "audit", "alert", "clock", "local0", "local1", "local2", "local3", "local4",
    "local5", "local6", "local7",
];

const SEVERITY_NAMES: [&str; 8] = [
    "emerg", "alert", "crit", "err", "warning", "notice", "info", "debug",
];

fn local_host_name() -> &'static str {
    static NAME: OnceLock<String> = OnceLock::new();
    NAME.get_or_init(|| {
        std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
            })
            .unwrap_or_else(|| "localhost".to_string())
    })
}

fn append_value(out: &mut String, msg: &LogRecord, handle: log_event::NVHandle) {
    if let Some((bytes, _)) = msg.get_value(handle) {
        out.push_str(&String::from_utf8_lossy(bytes));
    }
}

/// Expand one macro into `out`.
pub fn expand(
    out: &mut String,
    mac: Macro,
    msg: &LogRecord,
    opts: &TemplateOptions,
    seq_num: u32,
) {
    use MacroKind::*;

    let stamp = resolve_stamp(msg, mac.scope);
    let dt = zoned(&stamp, opts);
    match mac.kind {
        Date => {
            out.push_str(&dt.format("%b %e %H:%M:%S").to_string());
        }
        IsoDate => {
            out.push_str(&dt.format("%Y-%m-%dT%H:%M:%S").to_string());
            append_frac(out, stamp.ut_usec, opts.frac_digits);
            append_tzoffset(out, dt.offset().local_minus_utc());
        }
        FullDate => {
            out.push_str(&dt.format("%Y %b %e %H:%M:%S").to_string());
        }
        UnixTime => {
            out.push_str(&stamp.ut_sec.to_string());
            append_frac(out, stamp.ut_usec, opts.frac_digits);
        }
        Stamp => {
            crate::template::append_stamp(out, &stamp, opts);
        }
        Tz => append_tzoffset(out, dt.offset().local_minus_utc()),
        TzOffset => append_tzoffset(out, dt.offset().local_minus_utc()),
        Year => out.push_str(&dt.format("%Y").to_string()),
        Month => out.push_str(&dt.format("%m").to_string()),
        Day => out.push_str(&dt.format("%d").to_string()),
        Hour => out.push_str(&dt.format("%H").to_string()),
        Min => out.push_str(&dt.format("%M").to_string()),
        Sec => out.push_str(&dt.format("%S").to_string()),
        Usec => out.push_str(&format!("{:06}", stamp.ut_usec)),
        Msec => out.push_str(&format!("{:03}", stamp.ut_usec / 1000)),
        WeekDay => out.push_str(&dt.format("%a").to_string()),
        MonthName => out.push_str(&dt.format("%b").to_string()),
        Host => append_value(out, msg, builtin::HOST),
        Program => append_value(out, msg, builtin::PROGRAM),
        Pid => append_value(out, msg, builtin::PID),
        MsgId => append_value(out, msg, builtin::MSGID),
        Message => append_value(out, msg, builtin::MESSAGE),
        MsgHdr => {
            if let Some((hdr, _)) = msg.get_value(builtin::LEGACY_MSGHDR) {
                out.push_str(&String::from_utf8_lossy(hdr));
            } else if let Some((program, _)) = msg.get_value(builtin::PROGRAM) {
                out.push_str(&String::from_utf8_lossy(program));
                if let Some((pid, _)) = msg.get_value(builtin::PID) {
                    out.push('[');
                    out.push_str(&String::from_utf8_lossy(pid));
                    out.push(']');
                }
                out.push_str(": ");
            }
        }
        Tags => {
            let mut first = true;
            msg.tags_foreach(|_, name| {
                if !first {
                    out.push(',');
                }
                first = false;
                out.push_str(name);
            });
        }
        Pri => out.push_str(&msg.pri.to_string()),
        Facility => {
            let facility = (msg.pri >> 3) as usize;
            match FACILITY_NAMES.get(facility) {
                Some(name) => out.push_str(name),
                None => out.push_str(&facility.to_string()),
            }
        }
        FacilityNum => out.push_str(&(msg.pri >> 3).to_string()),
        Severity => out.push_str(SEVERITY_NAMES[(msg.pri & 7) as usize]),
        SeverityNum => out.push_str(&(msg.pri & 7).to_string()),
        SeqNum => {
            if seq_num != 0 {
                out.push_str(&seq_num.to_string());
            }
        }
        RcptId => out.push_str(&msg.rcpt_id.to_string()),
        HostId => out.push_str(&format!("{:08x}", msg.host_id)),
        UniqId => out.push_str(&format!("{:08x}@{:016x}", msg.host_id, msg.rcpt_id)),
        SysUptime => {
            // centiseconds since process start
            out.push_str(&(process_start().elapsed().as_millis() / 10).to_string());
        }
        LogHost => out.push_str(local_host_name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_resolves_scopes() {
        let plain = lookup("DATE").unwrap();
        assert_eq!(plain.kind, MacroKind::Date);
        assert_eq!(plain.scope, TimeScope::Stamp);

        let received = lookup("R_ISODATE").unwrap();
        assert_eq!(received.kind, MacroKind::IsoDate);
        assert_eq!(received.scope, TimeScope::Received);

        assert_eq!(lookup("C_HOUR").unwrap().scope, TimeScope::Current);
        assert_eq!(lookup("P_STAMP").unwrap().scope, TimeScope::Processed);
    }

    #[test]
    fn plain_macros_reject_scope_prefixes() {
        assert!(lookup("HOST").is_some());
        assert!(lookup("R_HOST").is_none());
        assert!(lookup("NO_SUCH_MACRO").is_none());
    }
}
