// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed values stored in name-value tables.
//!
//! Every stored value carries a type tag; the serialized representation is
//! always a textual form that parses back to the declared type.

use std::fmt;

/// The closed set of value types an event may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ValueType {
    #[default]
    String = 0,
    Json = 1,
    Boolean = 2,
    Integer = 3,
    Double = 4,
    Datetime = 5,
    List = 6,
    Null = 7,
    Bytes = 8,
    Protobuf = 9,
    /// Marks "unset"; [`ValueType::Null`] is an explicit null value.
    None = 10,
}

impl ValueType {
    pub fn from_u8(v: u8) -> Option<ValueType> {
        Some(match v {
            0 => ValueType::String,
            1 => ValueType::Json,
            2 => ValueType::Boolean,
            3 => ValueType::Integer,
            4 => ValueType::Double,
            5 => ValueType::Datetime,
            6 => ValueType::List,
            7 => ValueType::Null,
            8 => ValueType::Bytes,
            9 => ValueType::Protobuf,
            10 => ValueType::None,
            _ => return Option::None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Json => "json",
            ValueType::Boolean => "boolean",
            ValueType::Integer => "int64",
            ValueType::Double => "double",
            ValueType::Datetime => "datetime",
            ValueType::List => "list",
            ValueType::Null => "null",
            ValueType::Bytes => "bytes",
            ValueType::Protobuf => "protobuf",
            ValueType::None => "none",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check that `value` parses as `ty`'s textual form.
///
/// String-like kinds accept anything; the scalar kinds validate strictly so
/// a round-trip through serialization cannot change a value's meaning.
pub fn value_parses_as(ty: ValueType, value: &[u8]) -> bool {
    match ty {
        ValueType::String
        | ValueType::Json
        | ValueType::Bytes
        | ValueType::Protobuf
        | ValueType::List => true,
        ValueType::Null | ValueType::None => value.is_empty(),
        ValueType::Boolean => parse_boolean(value).is_some(),
        ValueType::Integer => std::str::from_utf8(value)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .is_some(),
        ValueType::Double => std::str::from_utf8(value)
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .is_some(),
        ValueType::Datetime => parse_datetime(value).is_some(),
    }
}

/// Parse the textual boolean forms: `true`/`false`, `0`/`1`.
pub fn parse_boolean(value: &[u8]) -> Option<bool> {
    match value {
        b"true" | b"1" => Some(true),
        b"false" | b"0" => Some(false),
        _ => Option::None,
    }
}

/// Parse a textual datetime as `seconds[.frac][+/-]` unix time with an
/// optional `@gmtoff` suffix, e.g. `1710074096.789+01:00` or plain seconds.
pub fn parse_datetime(value: &[u8]) -> Option<(i64, u32, Option<i32>)> {
    let s = std::str::from_utf8(value).ok()?.trim();
    let (stamp, gmtoff) = match s.find(['+', '-']) {
        Some(pos) if pos > 0 => {
            let (stamp, zone) = s.split_at(pos);
            (stamp, Some(parse_gmtoff(zone)?))
        }
        _ => (s, Option::None),
    };
    let (sec, usec) = match stamp.split_once('.') {
        Some((sec, frac)) => {
            let sec = sec.parse::<i64>().ok()?;
            if frac.len() > 6 || frac.is_empty() {
                return Option::None;
            }
            let mut usec = frac.parse::<u32>().ok()?;
            for _ in frac.len()..6 {
                usec *= 10;
            }
            (sec, usec)
        }
        Option::None => (stamp.parse::<i64>().ok()?, 0),
    };
    Some((sec, usec, gmtoff))
}

fn parse_gmtoff(zone: &str) -> Option<i32> {
    let (sign, rest) = match zone.as_bytes().first()? {
        b'+' => (1, &zone[1..]),
        b'-' => (-1, &zone[1..]),
        _ => return Option::None,
    };
    let (hours, minutes) = rest.split_once(':')?;
    let hours = hours.parse::<i32>().ok()?;
    let minutes = minutes.parse::<i32>().ok()?;
    if hours > 14 || minutes > 59 {
        return Option::None;
    }
    Some(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tags_round_trip() {
        for v in 0..=10u8 {
            assert_eq!(ValueType::from_u8(v).unwrap() as u8, v);
        }
        assert!(ValueType::from_u8(11).is_none());
    }

    #[test]
    fn scalar_validation() {
        assert!(value_parses_as(ValueType::Integer, b"-42"));
        assert!(!value_parses_as(ValueType::Integer, b"nope"));
        assert!(value_parses_as(ValueType::Boolean, b"true"));
        assert!(value_parses_as(ValueType::Boolean, b"0"));
        assert!(!value_parses_as(ValueType::Boolean, b"yes"));
        assert!(value_parses_as(ValueType::Double, b"3.25"));
        assert!(value_parses_as(ValueType::Null, b""));
        assert!(!value_parses_as(ValueType::Null, b"null"));
    }

    #[test]
    fn datetime_forms() {
        assert_eq!(parse_datetime(b"1710074096"), Some((1710074096, 0, None)));
        assert_eq!(
            parse_datetime(b"1710074096.789"),
            Some((1710074096, 789000, None))
        );
        assert_eq!(
            parse_datetime(b"1710074096.789+01:00"),
            Some((1710074096, 789000, Some(3600)))
        );
        assert_eq!(
            parse_datetime(b"1710074096.5-05:30"),
            Some((1710074096, 500000, Some(-(5 * 3600 + 30 * 60))))
        );
        assert!(parse_datetime(b"not-a-date").is_none());
    }
}
