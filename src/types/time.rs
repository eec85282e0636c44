//! Date and time values in PostgreSQL's ISO output style.

use std::io::Write as _;

use chrono::{
    DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Timelike,
    Utc,
};

use super::{Append, Flags, Scan};
use crate::error::{Error, Result};

/// A parsed date/time column. The variant depends on the text shape, not on
/// the column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedTime {
    Date(NaiveDate),
    Time(NaiveTime),
    /// `timestamp` without a zone.
    Naive(NaiveDateTime),
    Zoned(DateTime<FixedOffset>),
}

const DATE_LEN: usize = "2006-01-02".len();

/// Parses date, time, timestamp and timestamptz text. Zones may be written
/// as `±HH`, `±HH:MM` or `±HH:MM:SS`.
pub fn parse_time(s: &str) -> Result<ParsedTime> {
    let bad = |e: chrono::ParseError| Error::Decode(format!("can't parse {:?} as time: {}", s, e));
    let b = s.as_bytes();
    let len = b.len();

    if len <= DATE_LEN {
        return NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(ParsedTime::Date)
            .map_err(bad);
    }
    if b[2] == b':' {
        return NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
            .map(ParsedTime::Time)
            .map_err(bad);
    }

    let zone_at = [9, 6, 3]
        .into_iter()
        .map(|w| len - w)
        .find(|&i| i > DATE_LEN && matches!(b[i], b'+' | b'-'));

    let Some(zone_at) = zone_at else {
        return parse_naive(s).map(ParsedTime::Naive).map_err(bad);
    };

    let naive = parse_naive(&s[..zone_at]).map_err(bad)?;
    let offset = parse_offset(&s[zone_at..])
        .ok_or_else(|| Error::Decode(format!("invalid time zone in {:?}", s)))?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(ParsedTime::Zoned)
        .ok_or_else(|| Error::Decode(format!("ambiguous time {:?}", s)))
}

fn parse_naive(s: &str) -> std::result::Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
}

fn parse_offset(zone: &str) -> Option<FixedOffset> {
    let (sign, rest) = match zone.as_bytes().first()? {
        b'+' => (1, &zone[1..]),
        b'-' => (-1, &zone[1..]),
        _ => return None,
    };
    let mut secs = 0;
    for (i, part) in rest.split(':').enumerate() {
        let n: i32 = part.parse().ok()?;
        secs += match i {
            0 => n * 3600,
            1 => n * 60,
            2 => n,
            _ => return None,
        };
    }
    FixedOffset::east_opt(sign * secs)
}

impl ParsedTime {
    /// Resolves the value to an instant. Naive values are taken as local time.
    pub fn to_fixed(self) -> Result<DateTime<FixedOffset>> {
        let naive = match self {
            ParsedTime::Zoned(t) => return Ok(t),
            ParsedTime::Naive(t) => t,
            ParsedTime::Date(d) => d.and_time(NaiveTime::MIN),
            ParsedTime::Time(_) => {
                return Err(Error::Decode("time of day has no date".to_string()))
            }
        };
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|t| t.with_timezone(&t.offset().fix()))
            .ok_or_else(|| Error::Decode(format!("{} does not exist in local time", naive)))
    }
}

// ============================================================================
// Rendering
// ============================================================================

fn open(dst: &mut Vec<u8>, flags: Flags) {
    if flags.contains(Flags::ARRAY) {
        dst.push(b'"');
    } else if flags.contains(Flags::QUOTE) {
        dst.push(b'\'');
    }
}

fn close(dst: &mut Vec<u8>, flags: Flags) {
    open(dst, flags);
}

fn write_date(dst: &mut Vec<u8>, d: NaiveDate) {
    let _ = write!(dst, "{}", d.format("%Y-%m-%d"));
}

/// `HH:MM:SS` followed by the fraction with trailing zeros trimmed.
fn write_time(dst: &mut Vec<u8>, t: NaiveTime) {
    let _ = write!(dst, "{:02}:{:02}:{:02}", t.hour(), t.minute(), t.second());
    let nanos = t.nanosecond() % 1_000_000_000;
    if nanos != 0 {
        let frac = format!("{:09}", nanos);
        dst.push(b'.');
        dst.extend_from_slice(frac.trim_end_matches('0').as_bytes());
    }
}

fn write_offset(dst: &mut Vec<u8>, offset: FixedOffset) {
    let secs = offset.local_minus_utc();
    let sign = if secs < 0 { '-' } else { '+' };
    let secs = secs.abs();
    let _ = write!(dst, "{}{:02}:{:02}", sign, secs / 3600, secs / 60 % 60);
    if secs % 60 != 0 {
        let _ = write!(dst, ":{:02}", secs % 60);
    }
}

impl Append for NaiveDate {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        open(dst, flags);
        write_date(dst, *self);
        close(dst, flags);
    }
}

impl Append for NaiveTime {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        open(dst, flags);
        write_time(dst, *self);
        close(dst, flags);
    }
}

impl Append for NaiveDateTime {
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        open(dst, flags);
        write_date(dst, self.date());
        dst.push(b' ');
        write_time(dst, self.time());
        close(dst, flags);
    }

    fn is_zero(&self) -> bool {
        *self == NaiveDateTime::default()
    }
}

impl<Tz: TimeZone> Append for DateTime<Tz>
where
    DateTime<Tz>: Sync,
{
    fn append_value(&self, dst: &mut Vec<u8>, flags: Flags) {
        let local = self.naive_local();
        open(dst, flags);
        write_date(dst, local.date());
        dst.push(b' ');
        write_time(dst, local.time());
        write_offset(dst, self.offset().fix());
        close(dst, flags);
    }

    fn is_zero(&self) -> bool {
        self.timestamp() == 0 && self.timestamp_subsec_nanos() == 0
    }
}

// ============================================================================
// Scanning
// ============================================================================

fn parse_src(src: &[u8]) -> Result<ParsedTime> {
    let s = std::str::from_utf8(src).map_err(|e| Error::Decode(e.to_string()))?;
    parse_time(s)
}

impl Scan for NaiveDate {
    fn scan(src: Option<&[u8]>) -> Result<Self> {
        let Some(src) = src else {
            return Ok(NaiveDate::default());
        };
        match parse_src(src)? {
            ParsedTime::Date(d) => Ok(d),
            ParsedTime::Naive(t) => Ok(t.date()),
            ParsedTime::Zoned(t) => Ok(t.date_naive()),
            ParsedTime::Time(_) => Err(Error::Decode("can't scan time into date".to_string())),
        }
    }
}

impl Scan for NaiveTime {
    fn scan(src: Option<&[u8]>) -> Result<Self> {
        let Some(src) = src else {
            return Ok(NaiveTime::default());
        };
        match parse_src(src)? {
            ParsedTime::Time(t) => Ok(t),
            ParsedTime::Naive(t) => Ok(t.time()),
            ParsedTime::Zoned(t) => Ok(t.time()),
            ParsedTime::Date(_) => Ok(NaiveTime::MIN),
        }
    }
}

impl Scan for NaiveDateTime {
    fn scan(src: Option<&[u8]>) -> Result<Self> {
        let Some(src) = src else {
            return Ok(NaiveDateTime::default());
        };
        match parse_src(src)? {
            ParsedTime::Naive(t) => Ok(t),
            ParsedTime::Zoned(t) => Ok(t.naive_utc()),
            ParsedTime::Date(d) => Ok(d.and_time(NaiveTime::MIN)),
            ParsedTime::Time(_) => {
                Err(Error::Decode("can't scan time into timestamp".to_string()))
            }
        }
    }
}

impl Scan for DateTime<FixedOffset> {
    fn scan(src: Option<&[u8]>) -> Result<Self> {
        match src {
            None => Ok(DateTime::<FixedOffset>::default()),
            Some(src) => parse_src(src)?.to_fixed(),
        }
    }
}

impl Scan for DateTime<Utc> {
    fn scan(src: Option<&[u8]>) -> Result<Self> {
        match src {
            None => Ok(DateTime::<Utc>::default()),
            Some(src) => Ok(parse_src(src)?.to_fixed()?.with_timezone(&Utc)),
        }
    }
}

impl Scan for DateTime<Local> {
    fn scan(src: Option<&[u8]>) -> Result<Self> {
        match src {
            None => Ok(DateTime::<Local>::default()),
            Some(src) => Ok(parse_src(src)?.to_fixed()?.with_timezone(&Local)),
        }
    }
}
