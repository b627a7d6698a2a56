// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Syslog message parsing (RFC 5424 with RFC 3164 fallback) and the
//! parser node.
//!
//! Individual field problems tag the record and parsing continues; only a
//! structurally hopeless input counts as a failure, which the node either
//! drops (the default) or forwards unchanged when configured to.

use chrono::{Datelike, TimeZone};
use log_event::{builtin, lf, LogMessage, LogRecord, PathOptions, StampKind, UnixTime, ValueType};

use crate::node::{self, NodeRef, PipelineError, PipelineNode};

/// Tags applied while parsing.
pub mod parse_tags {
    pub const MISSING_PRI: &str = "syslog.missing_pri";
    pub const MISSING_TIMESTAMP: &str = "syslog.missing_timestamp";
    pub const INVALID_TIMESTAMP: &str = "syslog.invalid_timestamp";
    pub const RFC5424_MISSING_HOSTNAME: &str = "syslog.rfc5424_missing_hostname";
    pub const RFC5424_INVALID_SDATA: &str = "syslog.rfc5424_invalid_sdata";
    pub const UNPARSEABLE: &str = "syslog.unparseable";
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseFailure {
    #[error("message is empty")]
    Empty,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyslogParser {
    /// Treat missing fields strictly (still tag-and-continue; reserved
    /// for stricter dialects).
    pub strict: bool,
}

impl SyslogParser {
    /// Parse `raw` into `record`, filling the built-in fields, structured
    /// data and the sender's timestamp.
    pub fn parse(&self, record: &mut LogRecord, raw: &[u8]) -> Result<(), ParseFailure> {
        if raw.is_empty() {
            return Err(ParseFailure::Empty);
        }
        record.recvd_rawmsg_size = raw.len() as u32;
        let text: String = match std::str::from_utf8(raw) {
            Ok(s) => {
                record.flags |= lf::UTF8;
                s.to_string()
            }
            Err(_) => String::from_utf8_lossy(raw).to_string(),
        };
        let mut input = text.as_str();

        // <PRI>
        match parse_pri(input) {
            Some((pri, rest)) => {
                record.pri = pri;
                input = rest;
            }
            None => {
                record.pri = 13; // user.notice
                record.set_tag_by_name(parse_tags::MISSING_PRI);
            }
        }

        if let Some(rest) = input.strip_prefix("1 ") {
            self.parse_rfc5424(record, rest);
        } else {
            self.parse_rfc3164(record, input);
        }
        Ok(())
    }

    fn parse_rfc5424(&self, record: &mut LogRecord, input: &str) {
        let mut fields = Fields { rest: input };

        match fields.next() {
            Some("-") | None => {
                record.set_tag_by_name(parse_tags::MISSING_TIMESTAMP);
            }
            Some(stamp) => match chrono::DateTime::parse_from_rfc3339(stamp) {
                Ok(dt) => {
                    record.set_timestamp(
                        StampKind::Message,
                        UnixTime::from_unix(
                            dt.timestamp(),
                            dt.timestamp_subsec_micros(),
                            Some(dt.offset().local_minus_utc()),
                        ),
                    );
                }
                Err(_) => {
                    record.set_tag_by_name(parse_tags::INVALID_TIMESTAMP);
                }
            },
        }

        match fields.next() {
            Some("-") | None => record.set_tag_by_name(parse_tags::RFC5424_MISSING_HOSTNAME),
            Some(host) => record.set_value(builtin::HOST, host.as_bytes(), ValueType::String),
        }
        if let Some(app) = fields.next_value() {
            record.set_value(builtin::PROGRAM, app.as_bytes(), ValueType::String);
        }
        if let Some(pid) = fields.next_value() {
            record.set_value(builtin::PID, pid.as_bytes(), ValueType::String);
        }
        if let Some(msgid) = fields.next_value() {
            record.set_value(builtin::MSGID, msgid.as_bytes(), ValueType::String);
        }

        let rest = fields.rest;
        let rest = match parse_sdata(record, rest) {
            Ok(rest) => rest,
            Err(rest) => {
                record.set_tag_by_name(parse_tags::RFC5424_INVALID_SDATA);
                rest
            }
        };

        let mut msg = rest.strip_prefix(' ').unwrap_or(rest);
        msg = msg.strip_prefix('\u{feff}').unwrap_or(msg);
        record.set_value(builtin::MESSAGE, msg.as_bytes(), ValueType::String);
    }

    fn parse_rfc3164(&self, record: &mut LogRecord, input: &str) {
        let (stamp, rest) = match parse_bsd_timestamp(input, record.stamp(StampKind::Received)) {
            Some((stamp, rest)) => (Some(stamp), rest),
            None => {
                record.set_tag_by_name(parse_tags::MISSING_TIMESTAMP);
                (None, input)
            }
        };
        if let Some(stamp) = stamp {
            record.set_timestamp(StampKind::Message, stamp);
        }

        let rest = rest.trim_start_matches(' ');
        let (host, rest) = match rest.split_once(' ') {
            Some((host, rest)) if stamp.is_some() && !host.is_empty() && !host.contains(':') => {
                (Some(host), rest)
            }
            _ => (None, rest),
        };
        if let Some(host) = host {
            record.set_value(builtin::HOST, host.as_bytes(), ValueType::String);
        }

        // TAG[pid]: message
        let header_len = rest
            .find(|c: char| c == ':' || c == ' ')
            .filter(|&i| rest.as_bytes().get(i) == Some(&b':'))
            .map(|i| i + 1);
        match header_len {
            Some(len) if len > 1 => {
                let header = &rest[..len];
                let tag = header.trim_end_matches(':');
                let (program, pid) = match tag.split_once('[') {
                    Some((program, pid)) => (program, pid.strip_suffix(']')),
                    None => (tag, None),
                };
                record.set_value(builtin::PROGRAM, program.as_bytes(), ValueType::String);
                if let Some(pid) = pid {
                    record.set_value(builtin::PID, pid.as_bytes(), ValueType::String);
                }
                let message = rest[len..].strip_prefix(' ').unwrap_or(&rest[len..]);
                record.set_value(builtin::MESSAGE, message.as_bytes(), ValueType::String);
                // keep the verbatim header; set after PROGRAM/PID which
                // invalidate it
                let mut hdr = header.to_string();
                hdr.push(' ');
                record.set_value(builtin::LEGACY_MSGHDR, hdr.as_bytes(), ValueType::String);
            }
            _ => {
                record.set_value(builtin::MESSAGE, rest.as_bytes(), ValueType::String);
            }
        }
    }
}

struct Fields<'a> {
    rest: &'a str,
}

impl<'a> Fields<'a> {
    fn next(&mut self) -> Option<&'a str> {
        if self.rest.is_empty() {
            return None;
        }
        match self.rest.split_once(' ') {
            Some((field, rest)) => {
                self.rest = rest;
                Some(field)
            }
            None => {
                let field = self.rest;
                self.rest = "";
                Some(field)
            }
        }
    }

    /// Like `next`, but the RFC nil value reads as absent.
    fn next_value(&mut self) -> Option<&'a str> {
        match self.next() {
            Some("-") | None => None,
            Some(v) => Some(v),
        }
    }
}

fn parse_pri(input: &str) -> Option<(u16, &str)> {
    let rest = input.strip_prefix('<')?;
    let end = rest.find('>')?;
    if end == 0 || end > 3 {
        return None;
    }
    let pri = rest[..end].parse::<u16>().ok()?;
    if pri > 191 {
        return None;
    }
    Some((pri, &rest[end + 1..]))
}

/// `[id key="value" ...]...` blocks into `.SDATA.id.key` entries.
/// Returns the remaining input; `Err` carries the remainder past the
/// point where parsing broke down.
fn parse_sdata<'a>(record: &mut LogRecord, input: &'a str) -> Result<&'a str, &'a str> {
    if let Some(rest) = input.strip_prefix('-') {
        return Ok(rest);
    }
    let mut rest = input;
    if !rest.starts_with('[') {
        return Err(rest);
    }
    while let Some(block) = rest.strip_prefix('[') {
        let end = find_block_end(block).ok_or(rest)?;
        let body = &block[..end];
        rest = &block[end + 1..];

        let mut parts = body.splitn(2, ' ');
        let id = parts.next().unwrap_or_default();
        if id.is_empty() {
            return Err(rest);
        }
        let mut params = parts.next().unwrap_or_default();
        while !params.is_empty() {
            params = params.trim_start_matches(' ');
            let Some((key, tail)) = params.split_once("=\"") else {
                break;
            };
            let Some(value_end) = find_quoted_end(tail) else {
                return Err(rest);
            };
            let value = unescape_sd_value(&tail[..value_end]);
            params = &tail[value_end + 1..];

            let name = format!(".SDATA.{id}.{key}");
            record.set_value_by_name(&name, value.as_bytes(), ValueType::String);
        }
    }
    Ok(rest)
}

fn find_block_end(block: &str) -> Option<usize> {
    let bytes = block.as_bytes();
    let mut i = 0;
    let mut quoted = false;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if quoted => i += 1,
            b'"' => quoted = !quoted,
            b']' if !quoted => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

fn find_quoted_end(tail: &str) -> Option<usize> {
    let bytes = tail.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 1,
            b'"' => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

fn unescape_sd_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next @ ('"' | '\\' | ']')) => out.push(next),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// `Mmm dd HH:MM:SS`, year inferred from the reception time.
fn parse_bsd_timestamp<'a>(input: &'a str, received: &UnixTime) -> Option<(UnixTime, &'a str)> {
    if input.len() < 15 {
        return None;
    }
    let (stamp, rest) = input.split_at(15);
    let months = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    let month = months.iter().position(|m| stamp.starts_with(m))? as u32 + 1;
    let day = stamp[4..6].trim_start().parse::<u32>().ok()?;
    let hour = stamp[7..9].parse::<u32>().ok()?;
    let minute = stamp[10..12].parse::<u32>().ok()?;
    let second = stamp[13..15].parse::<u32>().ok()?;

    let received_local = chrono::Local
        .timestamp_opt(received.ut_sec.max(0), 0)
        .single()?;
    let year = received_local.year();
    let local = chrono::Local
        .with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()?;
    Some((
        UnixTime::from_unix(
            local.timestamp(),
            0,
            Some(local.offset().local_minus_utc()),
        ),
        rest,
    ))
}

/// Failure policy of a [`ParserNode`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Ack and drop messages the parser cannot handle.
    #[default]
    Drop,
    /// Forward the message unchanged, tagged as unparseable.
    Forward,
}

/// Pipeline node running the syslog parser over the MESSAGE value.
pub struct ParserNode {
    parser: SyslogParser,
    on_failure: FailurePolicy,
    next: Option<NodeRef>,
    info: String,
}

impl ParserNode {
    pub fn new(
        parser: SyslogParser,
        on_failure: FailurePolicy,
        next: Option<NodeRef>,
    ) -> ParserNode {
        ParserNode {
            parser,
            on_failure,
            next,
            info: "syslog-parser".to_string(),
        }
    }
}

impl PipelineNode for ParserNode {
    fn init(&self) -> Result<(), PipelineError> {
        if let Some(next) = &self.next {
            next.init()?;
        }
        Ok(())
    }

    fn deinit(&self) {
        if let Some(next) = &self.next {
            next.deinit();
        }
    }

    fn queue(&self, mut msg: LogMessage, path_options: &PathOptions<'_>) {
        let input: Vec<u8> = match msg.get_value(builtin::MESSAGE) {
            Some((bytes, _)) => bytes.to_vec(),
            None => Vec::new(),
        };
        let record = LogRecord::make_writable(&mut msg, path_options);
        match self.parser.parse(record, &input) {
            Ok(()) => node::forward_or_ack(self.next.as_ref(), msg, path_options),
            Err(err) => match self.on_failure {
                FailurePolicy::Drop => {
                    tracing::debug!(%err, "dropping unparseable message");
                    node::drop_message(msg, path_options);
                }
                FailurePolicy::Forward => {
                    record.set_tag_by_name(parse_tags::UNPARSEABLE);
                    node::forward_or_ack(self.next.as_ref(), msg, path_options);
                }
            },
        }
    }

    fn node_info(&self) -> &str {
        &self.info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log_event::get_tag_id;

    fn parse(raw: &str) -> LogRecord {
        let mut record = LogRecord::new_empty();
        SyslogParser::default()
            .parse(&mut record, raw.as_bytes())
            .unwrap();
        record
    }

    fn value(record: &LogRecord, handle: log_event::NVHandle) -> String {
        record
            .get_value(handle)
            .map(|(v, _)| String::from_utf8_lossy(v).to_string())
            .unwrap_or_default()
    }

    #[test]
    fn rfc5424_full_line() {
        let record = parse("<13>1 2024-03-10T12:34:56.789Z host app 123 ID - hello");
        assert_eq!(record.pri, 13);
        assert_eq!(value(&record, builtin::HOST), "host");
        assert_eq!(value(&record, builtin::PROGRAM), "app");
        assert_eq!(value(&record, builtin::PID), "123");
        assert_eq!(value(&record, builtin::MSGID), "ID");
        assert_eq!(value(&record, builtin::MESSAGE), "hello");
        let stamp = record.stamp(StampKind::Message);
        assert_eq!(stamp.ut_sec, 1710074096);
        assert_eq!(stamp.ut_usec, 789000);
        assert_eq!(stamp.ut_gmtoff, Some(0));
    }

    #[test]
    fn rfc5424_structured_data() {
        let record = parse(
            "<165>1 2003-10-11T22:14:15.003Z mymachine evntslog - ID47 \
             [exampleSDID@32473 iut=\"3\" eventSource=\"Application\"] An application event",
        );
        assert_eq!(
            value(
                &record,
                log_event::get_handle(".SDATA.exampleSDID@32473.iut").unwrap()
            ),
            "3"
        );
        assert_eq!(
            value(
                &record,
                log_event::get_handle(".SDATA.exampleSDID@32473.eventSource").unwrap()
            ),
            "Application"
        );
        assert_eq!(value(&record, builtin::MESSAGE), "An application event");
        assert_eq!(record.sdata_handles().len(), 2);
    }

    #[test]
    fn rfc5424_escaped_sd_value() {
        let record = parse("<13>1 - h a 1 - [b@1 k=\"say \\\"hi\\\"\"] m");
        assert_eq!(
            value(&record, log_event::get_handle(".SDATA.b@1.k").unwrap()),
            "say \"hi\""
        );
    }

    #[test]
    fn rfc5424_nil_hostname_is_tagged() {
        let record = parse("<13>1 2024-03-10T12:34:56Z - app - - - msg");
        assert!(record.has_tag(get_tag_id(parse_tags::RFC5424_MISSING_HOSTNAME)));
        assert_eq!(value(&record, builtin::MESSAGE), "msg");
    }

    #[test]
    fn rfc3164_with_header() {
        let record = parse("<34>Oct 11 22:14:15 mymachine su[230]: 'su root' failed");
        assert_eq!(record.pri, 34);
        assert_eq!(value(&record, builtin::HOST), "mymachine");
        assert_eq!(value(&record, builtin::PROGRAM), "su");
        assert_eq!(value(&record, builtin::PID), "230");
        assert_eq!(value(&record, builtin::MESSAGE), "'su root' failed");
        assert_eq!(value(&record, builtin::LEGACY_MSGHDR), "su[230]: ");
    }

    #[test]
    fn missing_pri_gets_default_and_tag() {
        let record = parse("no pri here");
        assert_eq!(record.pri, 13);
        assert!(record.has_tag(get_tag_id(parse_tags::MISSING_PRI)));
    }

    #[test]
    fn empty_input_fails() {
        let mut record = LogRecord::new_empty();
        assert_eq!(
            SyslogParser::default().parse(&mut record, b""),
            Err(ParseFailure::Empty)
        );
    }
}
