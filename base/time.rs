// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Time and durations for Moonfire Presence's internal format.

use crate::{bail, err, Error};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while_m_n};
use nom::combinator::{map, map_res, opt};
use nom::sequence::{preceded, tuple};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops;
use std::str::FromStr;

type IResult<'a, I, O> = nom::IResult<I, O, nom::error::VerboseError<&'a str>>;

pub const TIME_UNITS_PER_SEC: i64 = 90_000;

/// The zone to use for all time handling.
///
/// In normal operation this is assigned from `jiff::tz::TimeZone::system()`
/// at startup, but tests set it to a known political time zone instead.
/// It is fixed for the entire run so that day keys stay stable.
static GLOBAL_ZONE: std::sync::OnceLock<jiff::tz::TimeZone> = std::sync::OnceLock::new();

pub fn init_zone<F: FnOnce() -> jiff::tz::TimeZone>(f: F) {
    GLOBAL_ZONE.get_or_init(f);
}

pub fn global_zone() -> jiff::tz::TimeZone {
    GLOBAL_ZONE
        .get()
        .expect("global zone should be initialized")
        .clone()
}

/// A time specified as 90,000ths of a second since 1970-01-01 00:00:00 UTC.
#[derive(Clone, Copy, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Time(pub i64);

/// Returns a parser for a `len`-digit non-negative number which fits into `T`.
fn fixed_len_num<'a, T: FromStr>(len: usize) -> impl FnMut(&'a str) -> IResult<'a, &'a str, T> {
    map_res(
        take_while_m_n(len, len, |c: char| c.is_ascii_digit()),
        |input: &str| input.parse(),
    )
}

/// Parses `YYYY-mm-dd` into pieces.
fn parse_datepart(input: &str) -> IResult<&str, (i16, i8, i8)> {
    tuple((
        fixed_len_num(4),
        preceded(tag("-"), fixed_len_num(2)),
        preceded(tag("-"), fixed_len_num(2)),
    ))(input)
}

/// Parses `HH:MM[:SS[:FFFFF]]` into pieces.
fn parse_timepart(input: &str) -> IResult<&str, (i8, i8, i8, i32)> {
    let (input, (hr, _, min)) = tuple((fixed_len_num(2), tag(":"), fixed_len_num(2)))(input)?;
    let (input, stuff) = opt(tuple((
        preceded(tag(":"), fixed_len_num(2)),
        opt(preceded(tag(":"), fixed_len_num(5))),
    )))(input)?;
    let (sec, opt_subsec) = stuff.unwrap_or((0, None));
    Ok((input, (hr, min, sec, opt_subsec.unwrap_or(0))))
}

/// Parses `Z` (UTC) or `{+,-,}HH:MM` into a time zone offset in seconds.
fn parse_zone(input: &str) -> IResult<&str, i32> {
    alt((
        nom::combinator::value(0, tag("Z")),
        map(
            tuple((
                opt(nom::character::complete::one_of(&b"+-"[..])),
                fixed_len_num::<i32>(2),
                tag(":"),
                fixed_len_num::<i32>(2),
            )),
            |(sign, hr, _, min)| {
                let off = hr * 3600 + min * 60;
                if sign == Some('-') {
                    -off
                } else {
                    off
                }
            },
        ),
    ))(input)
}

impl Time {
    pub const MIN: Self = Time(i64::MIN);
    pub const MAX: Self = Time(i64::MAX);

    /// Builds a `Time` from seconds + nanoseconds since epoch, as from
    /// `clock_gettime`.
    pub fn from_unix(sec: i64, nsec: i64) -> Self {
        Time(sec * TIME_UNITS_PER_SEC + nsec * 9 / 100_000)
    }

    /// Parses a time as either 90,000ths of a second since epoch or a
    /// RFC 3339-like string.
    ///
    /// The latter is a date such as `2006-01-02T15:04:05`, followed by an
    /// optional 90,000ths of a second such as `:00001`, followed by an
    /// optional time zone offset such as `Z` or `-07:00`. A missing fraction
    /// is assumed to be 0. A missing time zone offset implies the global
    /// time zone.
    pub fn parse(input: &str) -> Result<Self, Error> {
        // First try parsing as 90,000ths of a second since epoch.
        if let Ok(i) = i64::from_str(input) {
            return Ok(Time(i));
        }

        // If that failed, parse as a time string or bust.
        let (remaining, ((tm_year, tm_mon, tm_mday), opt_time, opt_zone)) = tuple((
            parse_datepart,
            opt(preceded(tag("T"), parse_timepart)),
            opt(parse_zone),
        ))(input)
        .map_err(|e| match e {
            nom::Err::Incomplete(_) => err!(InvalidArgument, msg("incomplete")),
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                err!(InvalidArgument, source(nom::error::convert_error(input, e)))
            }
        })?;
        if !remaining.is_empty() {
            bail!(
                InvalidArgument,
                msg("unexpected suffix {remaining:?} following time string")
            );
        }
        let (tm_hour, tm_min, tm_sec, subsec) = opt_time.unwrap_or((0, 0, 0, 0));
        let dt = jiff::civil::DateTime::new(tm_year, tm_mon, tm_mday, tm_hour, tm_min, tm_sec, 0)
            .map_err(|e| err!(InvalidArgument, source(e)))?;
        let tz = if let Some(off) = opt_zone {
            jiff::tz::TimeZone::fixed(
                jiff::tz::Offset::from_seconds(off)
                    .map_err(|e| err!(InvalidArgument, msg("invalid time zone offset"), source(e)))?,
            )
        } else {
            global_zone()
        };
        let sec = tz
            .into_ambiguous_zoned(dt)
            .compatible()
            .map_err(|e| err!(InvalidArgument, source(e)))?
            .timestamp()
            .as_second();
        Ok(Time(sec * TIME_UNITS_PER_SEC + i64::from(subsec)))
    }

    /// Converts to unix seconds by floor method (rounding down).
    pub fn unix_seconds(self) -> i64 {
        self.0 / TIME_UNITS_PER_SEC
    }

    fn zoned(self) -> jiff::Zoned {
        let ts = jiff::Timestamp::new(
            self.unix_seconds(),
            ((self.0 % TIME_UNITS_PER_SEC) * 100_000 / 9) as i32,
        )
        .expect("valid timestamp");
        ts.to_zoned(global_zone())
    }

    /// Formats as ISO-8601/RFC 3339 in the global zone, e.g.
    /// `2024-05-01T09:30:00+02:00`, as used in broadcast messages.
    pub fn iso8601(self) -> String {
        self.zoned().strftime("%FT%T%:z").to_string()
    }

    /// The calendar day in the global zone as `YYYY-mm-dd`, as used for
    /// attendance bookkeeping.
    pub fn day_key(self) -> String {
        self.zoned().strftime("%F").to_string()
    }

    /// `HHMMSS`-style stamp used in snapshot filenames.
    pub fn filename_stamp(self) -> String {
        self.zoned().strftime("%Y%m%d_%H%M%S").to_string()
    }
}

impl ops::Sub for Time {
    type Output = Duration;
    fn sub(self, rhs: Time) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl ops::Add<Duration> for Time {
    type Output = Time;
    fn add(self, rhs: Duration) -> Time {
        Time(self.0 + rhs.0)
    }
}

impl ops::Sub<Duration> for Time {
    type Output = Time;
    fn sub(self, rhs: Duration) -> Time {
        Time(self.0 - rhs.0)
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.iso8601())
    }
}

/// A signed duration in 90,000ths of a second.
#[derive(Clone, Copy, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Duration(pub i64);

impl Duration {
    pub fn seconds(secs: i64) -> Self {
        Duration(secs * TIME_UNITS_PER_SEC)
    }

    pub fn milliseconds(millis: i64) -> Self {
        Duration(millis * TIME_UNITS_PER_SEC / 1_000)
    }

    /// Converts to a `std::time::Duration`, failing on negative values.
    pub fn to_std(self) -> Result<std::time::Duration, Error> {
        if self.0 < 0 {
            bail!(OutOfRange, msg("negative duration {}", self.0));
        }
        let secs = (self.0 / TIME_UNITS_PER_SEC) as u64;
        let nanos = ((self.0 % TIME_UNITS_PER_SEC) * 100_000 / 9) as u32;
        Ok(std::time::Duration::new(secs, nanos))
    }

    pub fn from_std(d: std::time::Duration) -> Self {
        Duration(d.as_secs() as i64 * TIME_UNITS_PER_SEC + d.subsec_nanos() as i64 * 9 / 100_000)
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let whole = self.0 / TIME_UNITS_PER_SEC;
        let frac = (self.0 % TIME_UNITS_PER_SEC).abs();
        if frac == 0 {
            write!(f, "{whole} s")
        } else {
            write!(f, "{whole}.{frac:05} s")
        }
    }
}

impl ops::Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0 + rhs.0)
    }
}

impl ops::AddAssign for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0;
    }
}

impl ops::Sub for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl ops::Mul<i64> for Duration {
    type Output = Duration;
    fn mul(self, rhs: i64) -> Duration {
        Duration(self.0 * rhs)
    }
}

pub mod testutil {
    pub fn init_zone() {
        super::init_zone(|| {
            jiff::tz::TimeZone::get("America/Los_Angeles").expect("test zone should exist")
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_numeric() {
        testutil::init_zone();
        assert_eq!(Time::parse("90000").unwrap(), Time(90000));
    }

    #[test]
    fn parse_and_format() {
        testutil::init_zone();
        // 2024-02-01T00:00:00Z == 1706745600.
        let t = Time::parse("2024-02-01T00:00:00Z").unwrap();
        assert_eq!(t.unix_seconds(), 1706745600);

        // Subsecond part.
        let t = Time::parse("2024-02-01T00:00:00:00001Z").unwrap();
        assert_eq!(t.0, 1706745600 * TIME_UNITS_PER_SEC + 1);

        // Explicit offset.
        let t2 = Time::parse("2024-01-31T16:00:00-08:00").unwrap();
        assert_eq!(t2.unix_seconds(), 1706745600);

        // Garbage.
        Time::parse("2024-02-01Tjunk").unwrap_err();
    }

    #[test]
    fn day_key() {
        testutil::init_zone();
        // 2024-02-01T12:00:00-08:00.
        let t = Time::from_unix(1706817600, 0);
        assert_eq!(t.day_key(), "2024-02-01");
    }

    #[test]
    fn durations() {
        assert_eq!(Duration::seconds(2).to_std().unwrap().as_secs(), 2);
        assert_eq!(Duration::milliseconds(300).0, 27_000);
        Duration(-1).to_std().unwrap_err();
        assert_eq!(Duration::seconds(90).to_string(), "90 s");
    }
}
