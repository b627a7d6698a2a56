// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event timestamps and timezone repair.
//!
//! Each record carries three stamps: when the message was received, the
//! time claimed by the sender, and when it was delivered. Offsets are kept
//! next to the unix time so a stamp can be rendered in the zone it was
//! produced in.

use chrono::{Offset, TimeZone};
use std::time::{SystemTime, UNIX_EPOCH};

/// Which of the three per-record stamps an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum StampKind {
    /// Set by the source driver on ingest.
    Received = 0,
    /// Claimed by the sender, parsed out of the message.
    Message = 1,
    /// Set when the destination delivers the record.
    Processed = 2,
}

/// A unix timestamp with microseconds and an optional UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnixTime {
    pub ut_sec: i64,
    pub ut_usec: u32,
    /// Seconds east of UTC; `None` when the zone is unknown.
    pub ut_gmtoff: Option<i32>,
}

impl UnixTime {
    pub fn now() -> UnixTime {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let local_offset = chrono::Local
            .timestamp_opt(elapsed.as_secs() as i64, 0)
            .single()
            .map(|dt| dt.offset().fix().local_minus_utc());
        UnixTime {
            ut_sec: elapsed.as_secs() as i64,
            ut_usec: elapsed.subsec_micros(),
            ut_gmtoff: local_offset,
        }
    }

    pub fn from_unix(ut_sec: i64, ut_usec: u32, ut_gmtoff: Option<i32>) -> UnixTime {
        UnixTime {
            ut_sec,
            ut_usec,
            ut_gmtoff,
        }
    }

    pub fn is_set(&self) -> bool {
        self.ut_sec != 0
    }

    /// Change the timezone reference, assuming the original zone was
    /// correct: the instant stays, only the displayed offset changes.
    pub fn set_timezone(&mut self, new_gmtoff: i32) {
        self.ut_gmtoff = Some(new_gmtoff);
    }

    /// Change the timezone assuming the original value was incorrectly
    /// used when the wall-clock fields were parsed: the displayed
    /// wall-clock time stays, the instant moves.
    pub fn fix_timezone(&mut self, new_gmtoff: i32) {
        let implied = self.ut_gmtoff.unwrap_or(0);
        self.ut_sec -= (new_gmtoff - implied) as i64;
        self.ut_gmtoff = Some(new_gmtoff);
    }

    /// Repair a stamp whose zone was mis-recognized at parse time,
    /// converting it into `tz`.
    ///
    /// Daylight saving thresholds are defined in local time, so a stamp
    /// that is off by a few hours may sit on the wrong side of a
    /// transition; up to three offset lookups are needed to converge.
    /// Within the transition hour itself the mapping is not linear and an
    /// extra hour is skipped, the same way `mktime()` treats such input.
    pub fn fix_timezone_with_tz<Tz: TimeZone>(&mut self, tz: &Tz) {
        let fixed_gmtoff = offset_at(tz, self.ut_sec);
        if Some(fixed_gmtoff) == self.ut_gmtoff {
            return;
        }
        self.fix_timezone(fixed_gmtoff);

        let alt_gmtoff = offset_at(tz, self.ut_sec);
        if alt_gmtoff == fixed_gmtoff {
            return;
        }
        // crossing the daylight saving change hour; ut_sec is more
        // accurate after the first fix
        self.fix_timezone(alt_gmtoff);

        if offset_at(tz, self.ut_sec) == fixed_gmtoff {
            // within the transition hour itself
            if alt_gmtoff > fixed_gmtoff {
                self.ut_sec += (alt_gmtoff - fixed_gmtoff) as i64;
            } else {
                self.ut_gmtoff =
                    Some(self.ut_gmtoff.unwrap_or(0) + (fixed_gmtoff - alt_gmtoff));
            }
        }
    }
}

fn offset_at<Tz: TimeZone>(tz: &Tz, ut_sec: i64) -> i32 {
    match tz.timestamp_opt(ut_sec, 0) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            dt.offset().fix().local_minus_utc()
        }
        chrono::LocalResult::None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_timezone_keeps_the_instant() {
        let mut t = UnixTime::from_unix(1710074096, 789000, Some(0));
        t.set_timezone(3600);
        assert_eq!(t.ut_sec, 1710074096);
        assert_eq!(t.ut_gmtoff, Some(3600));
    }

    #[test]
    fn fix_timezone_keeps_the_wall_clock() {
        // 12:34:56 parsed as UTC but actually +01:00
        let mut t = UnixTime::from_unix(1710074096, 0, Some(0));
        t.fix_timezone(3600);
        assert_eq!(t.ut_sec, 1710074096 - 3600);
        assert_eq!(t.ut_gmtoff, Some(3600));
    }

    #[test]
    fn fix_timezone_with_tz_converges_off_transition() {
        // midsummer, CET is at +02:00; stamp mis-parsed as UTC
        let tz: chrono_tz::Tz = "Europe/Budapest".parse().unwrap();
        let mut t = UnixTime::from_unix(1718966096, 0, Some(0));
        t.fix_timezone_with_tz(&tz);
        assert_eq!(t.ut_gmtoff, Some(7200));
        assert_eq!(t.ut_sec, 1718966096 - 7200);
    }

    #[test]
    fn fix_timezone_with_tz_transition_hour() {
        let tz: chrono_tz::Tz = "Europe/Budapest".parse().unwrap();
        // 2024-03-31 02:30 local does not exist (clocks jump 02:00->03:00);
        // constructed as if +01:00 had been valid
        let missing_local = 1711852200i64; // 2024-03-31 02:30:00 as if UTC
        let mut t = UnixTime::from_unix(missing_local, 0, Some(0));
        t.fix_timezone_with_tz(&tz);
        // converged: rendering ut_sec with ut_gmtoff lands after the jump
        let local = t.ut_sec + t.ut_gmtoff.unwrap() as i64;
        let local_dt = chrono::DateTime::from_timestamp(local, 0).unwrap();
        assert!(local_dt.format("%H:%M").to_string().as_str() >= "03:00");
    }
}
