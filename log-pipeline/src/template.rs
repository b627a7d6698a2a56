// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Compiled format templates.
//!
//! A template is compiled once into literal chunks and element references
//! (macros, name-value lookups, match captures) and evaluated per record
//! into a caller-provided buffer. `$NAME`, `${NAME}` and `$1..$255` are
//! the reference forms; `$$` produces a literal dollar.

use std::cell::RefCell;

use log_event::{registry, LogRecord, NVHandle, UnixTime};

use crate::macros::{self, Macro};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unterminated ${{...}} reference in template")]
    UnterminatedReference,
    #[error("empty reference in template")]
    EmptyReference,
    #[error("invalid value name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },
}

/// Per-template timestamp rendering style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampFormat {
    /// Classic BSD `Mmm dd hh:mm:ss`.
    Bsd,
    /// ISO 8601 with offset.
    #[default]
    Iso,
    /// `YYYY Mmm dd hh:mm:ss`, year included.
    Full,
    /// Seconds since the epoch.
    Unix,
}

/// Evaluation options; timezone handling and escaping are per-template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateOptions {
    pub ts_format: TimestampFormat,
    /// Fractional second digits, `0..=6`.
    pub frac_digits: u8,
    /// Render timestamps in this offset instead of each stamp's own.
    pub zone_override: Option<i32>,
    /// Rewrite quotes, backslash and control bytes to `\NNN` octal.
    pub escape: bool,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        TemplateOptions {
            ts_format: TimestampFormat::Iso,
            frac_digits: 3,
            zone_override: None,
            escape: false,
        }
    }
}

#[derive(Debug, Clone)]
enum TemplateElem {
    Literal(String),
    Value(NVHandle),
    Match(u8),
    Macro(Macro),
}

/// A compiled template.
#[derive(Debug, Clone)]
pub struct Template {
    elements: Vec<TemplateElem>,
    source: String,
}

impl Template {
    pub fn compile(text: &str) -> Result<Template, TemplateError> {
        macros::register_all();
        let mut elements = Vec::new();
        let mut literal = String::new();
        let mut rest = text;

        while let Some(pos) = rest.find('$') {
            literal.push_str(&rest[..pos]);
            rest = &rest[pos + 1..];
            match rest.as_bytes().first() {
                Some(b'$') => {
                    literal.push('$');
                    rest = &rest[1..];
                }
                Some(b'{') => {
                    let end = rest
                        .find('}')
                        .ok_or(TemplateError::UnterminatedReference)?;
                    let name = &rest[1..end];
                    push_literal(&mut elements, &mut literal);
                    elements.push(element_for(name)?);
                    rest = &rest[end + 1..];
                }
                Some(c) if c.is_ascii_alphanumeric() || *c == b'_' => {
                    let end = rest
                        .bytes()
                        .position(|b| !(b.is_ascii_alphanumeric() || b == b'_'))
                        .unwrap_or(rest.len());
                    let name = &rest[..end];
                    push_literal(&mut elements, &mut literal);
                    elements.push(element_for(name)?);
                    rest = &rest[end..];
                }
                _ => literal.push('$'),
            }
        }
        literal.push_str(rest);
        push_literal(&mut elements, &mut literal);

        Ok(Template {
            elements,
            source: text.to_string(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Append the expansion of this template for `msg` to `out`.
    pub fn format(
        &self,
        msg: &LogRecord,
        opts: &TemplateOptions,
        seq_num: u32,
        out: &mut String,
    ) {
        for elem in &self.elements {
            match elem {
                TemplateElem::Literal(text) => out.push_str(text),
                TemplateElem::Value(handle) => {
                    if let Some((bytes, _)) = msg.get_value(*handle) {
                        append_bytes(out, bytes, opts.escape);
                    }
                }
                TemplateElem::Match(index) => {
                    if let Some((bytes, _)) = msg.get_match(*index) {
                        append_bytes(out, bytes, opts.escape);
                    }
                }
                TemplateElem::Macro(mac) => {
                    if opts.escape {
                        with_scratch(|scratch| {
                            macros::expand(scratch, *mac, msg, opts, seq_num);
                            append_bytes(out, scratch.as_bytes(), true);
                        });
                    } else {
                        macros::expand(out, *mac, msg, opts, seq_num);
                    }
                }
            }
        }
    }

    /// Convenience wrapper returning a fresh string.
    pub fn format_to_string(&self, msg: &LogRecord, opts: &TemplateOptions, seq_num: u32) -> String {
        let mut out = String::new();
        self.format(msg, opts, seq_num, &mut out);
        out
    }
}

fn push_literal(elements: &mut Vec<TemplateElem>, literal: &mut String) {
    if !literal.is_empty() {
        elements.push(TemplateElem::Literal(std::mem::take(literal)));
    }
}

fn element_for(name: &str) -> Result<TemplateElem, TemplateError> {
    if name.is_empty() {
        return Err(TemplateError::EmptyReference);
    }
    if name.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(index) = name.parse::<u16>() {
            if index <= 255 {
                return Ok(TemplateElem::Match(index as u8));
            }
        }
    }
    if let Some(mac) = macros::lookup(name) {
        return Ok(TemplateElem::Macro(mac));
    }
    match registry::get_handle(name) {
        Ok(handle) => Ok(TemplateElem::Value(handle)),
        Err(err) => Err(TemplateError::InvalidName {
            name: name.to_string(),
            reason: err.to_string(),
        }),
    }
}

/// Render `stamp` according to the template's timestamp format.
pub(crate) fn append_stamp(out: &mut String, stamp: &UnixTime, opts: &TemplateOptions) {
    use chrono::TimeZone;
    let gmtoff = opts.zone_override.or(stamp.ut_gmtoff).unwrap_or(0);
    let offset = chrono::FixedOffset::east_opt(gmtoff)
        .unwrap_or_else(|| chrono::FixedOffset::east_opt(0).unwrap());
    let dt = offset
        .timestamp_opt(stamp.ut_sec, stamp.ut_usec * 1000)
        .single()
        .unwrap_or_else(|| offset.timestamp_opt(0, 0).unwrap());
    match opts.ts_format {
        TimestampFormat::Bsd => out.push_str(&dt.format("%b %e %H:%M:%S").to_string()),
        TimestampFormat::Iso => {
            out.push_str(&dt.format("%Y-%m-%dT%H:%M:%S").to_string());
            if opts.frac_digits > 0 {
                let digits = opts.frac_digits.min(6) as usize;
                let frac = format!("{:06}", stamp.ut_usec);
                out.push('.');
                out.push_str(&frac[..digits]);
            }
            let off = dt.offset().local_minus_utc();
            let (sign, abs) = if off < 0 { ('-', -off) } else { ('+', off) };
            out.push(sign);
            out.push_str(&format!("{:02}:{:02}", abs / 3600, abs % 3600 / 60));
        }
        TimestampFormat::Full => out.push_str(&dt.format("%Y %b %e %H:%M:%S").to_string()),
        TimestampFormat::Unix => {
            out.push_str(&stamp.ut_sec.to_string());
            if opts.frac_digits > 0 {
                let digits = opts.frac_digits.min(6) as usize;
                let frac = format!("{:06}", stamp.ut_usec);
                out.push('.');
                out.push_str(&frac[..digits]);
            }
        }
    }
}

fn append_bytes(out: &mut String, bytes: &[u8], escape: bool) {
    if !escape {
        out.push_str(&String::from_utf8_lossy(bytes));
        return;
    }
    for &b in bytes {
        match b {
            b'\'' | b'"' | b'\\' => {
                out.push('\\');
                out.push(b as char);
            }
            0..=0x1f | 0x7f => {
                out.push_str(&format!("\\{b:03o}"));
            }
            _ => out.push(b as char),
        }
    }
}

thread_local! {
    static SCRATCH_POOL: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Run `f` with a pooled scratch buffer; the buffer returns to the
/// thread-local pool afterwards so hot paths do not reallocate.
pub fn with_scratch<R>(f: impl FnOnce(&mut String) -> R) -> R {
    let mut buf = SCRATCH_POOL
        .with(|pool| pool.borrow_mut().pop())
        .unwrap_or_default();
    buf.clear();
    let result = f(&mut buf);
    SCRATCH_POOL.with(|pool| {
        let mut pool = pool.borrow_mut();
        if pool.len() < 8 {
            pool.push(buf);
        }
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use log_event::{builtin, LogRecord, StampKind, ValueType};

    fn sample_record() -> LogRecord {
        let mut record = LogRecord::new_empty();
        record.set_value(builtin::HOST, b"web-1", ValueType::String);
        record.set_value(builtin::PROGRAM, b"nginx", ValueType::String);
        record.set_value(builtin::PID, b"4242", ValueType::String);
        record.set_value(builtin::MESSAGE, b"request served", ValueType::String);
        record.pri = 13; // user.notice
        record.set_timestamp(
            StampKind::Message,
            log_event::UnixTime::from_unix(1710074096, 789000, Some(0)),
        );
        record
    }

    #[test]
    fn literal_and_values() {
        let template = Template::compile("host=$HOST msg=${MESSAGE}").unwrap();
        let out = template.format_to_string(&sample_record(), &TemplateOptions::default(), 0);
        assert_eq!(out, "host=web-1 msg=request served");
    }

    #[test]
    fn dollar_escape() {
        let template = Template::compile("cost=$$5").unwrap();
        let out = template.format_to_string(&sample_record(), &TemplateOptions::default(), 0);
        assert_eq!(out, "cost=$5");
    }

    #[test]
    fn isodate_macro() {
        let template = Template::compile("$ISODATE").unwrap();
        let out = template.format_to_string(&sample_record(), &TemplateOptions::default(), 0);
        assert_eq!(out, "2024-03-10T12:34:56.789+00:00");
    }

    #[test]
    fn zone_override_shifts_rendering() {
        let template = Template::compile("$ISODATE").unwrap();
        let opts = TemplateOptions {
            zone_override: Some(3600),
            ..Default::default()
        };
        let out = template.format_to_string(&sample_record(), &opts, 0);
        assert_eq!(out, "2024-03-10T13:34:56.789+01:00");
    }

    #[test]
    fn match_references() {
        let mut record = sample_record();
        record.set_match(1, b"captured", ValueType::String);
        let template = Template::compile("[$1]").unwrap();
        let out = template.format_to_string(&record, &TemplateOptions::default(), 0);
        assert_eq!(out, "[captured]");
    }

    #[test]
    fn priority_macros() {
        let template = Template::compile("<$PRI> $FACILITY.$SEVERITY").unwrap();
        let out = template.format_to_string(&sample_record(), &TemplateOptions::default(), 0);
        assert_eq!(out, "<13> user.notice");
    }

    #[test]
    fn msghdr_reconstructs_header() {
        let template = Template::compile("$MSGHDR").unwrap();
        let out = template.format_to_string(&sample_record(), &TemplateOptions::default(), 0);
        assert_eq!(out, "nginx[4242]: ");
    }

    #[test]
    fn escaping_rewrites_control_bytes() {
        let mut record = sample_record();
        record.set_value(builtin::MESSAGE, b"say \"hi\"\x01", ValueType::String);
        let template = Template::compile("$MESSAGE").unwrap();
        let opts = TemplateOptions {
            escape: true,
            ..Default::default()
        };
        let out = template.format_to_string(&record, &opts, 0);
        assert_eq!(out, "say \\\"hi\\\"\\001");
    }

    #[test]
    fn unterminated_brace_is_an_error() {
        assert_eq!(
            Template::compile("${NOPE").unwrap_err(),
            TemplateError::UnterminatedReference
        );
    }

    #[test]
    fn formatting_is_pure_over_referenced_handles() {
        let template = Template::compile("$HOST/$MESSAGE").unwrap();
        let opts = TemplateOptions::default();

        let a = sample_record();
        let mut b = LogRecord::new_empty();
        b.set_value(builtin::HOST, b"web-1", ValueType::String);
        b.set_value(builtin::MESSAGE, b"request served", ValueType::String);
        b.pri = 99; // differs on handles the template does not reference

        assert_eq!(
            template.format_to_string(&a, &opts, 0),
            template.format_to_string(&b, &opts, 0)
        );
    }
}
