use chrono::{DateTime, NaiveDateTime};
use serde::Serialize;

use crate::tools::error::{Error, Result};

/// Conversion factor from nanoseconds to the 32-bit binary fraction of a
/// second: 2^64 / 1e9, rounded.
///
/// All sub-second conversions go through nanoseconds with this single
/// constant. Separate constants for ms/us would each carry a different
/// rounding error, so a value written in one precision would not read back
/// cleanly in another; decadic scaling into nanoseconds keeps the rules
/// consistent: same-precision round trips are exact, coarser-to-finer reads
/// end in zeros, finer-to-coarser reads floor.
const NSEC_TO_FRAC: u64 = 0x44B8_2FA0_A;

/// Timestamp carried in telemetry records.
///
/// Stored as a 64-bit fixed-point number: Unix seconds in the upper 32 bits,
/// binary fraction of a second in the lower 32 bits.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
pub struct MsgTime(u64);

impl MsgTime {
    /// Wrap a raw 64-bit fixed-point value.
    pub const fn from_raw(raw: u64) -> Self {
        MsgTime(raw)
    }

    /// The raw 64-bit fixed-point value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Build from Unix seconds and nanoseconds.
    pub fn from_sec_nsec(sec: u32, nsec: u32) -> Self {
        MsgTime(((sec as u64) << 32) | ((nsec as u64 * NSEC_TO_FRAC) >> 32))
    }

    /// Build from Unix seconds and microseconds.
    pub fn from_sec_usec(sec: u32, usec: u32) -> Self {
        MsgTime(((sec as u64) << 32) | ((usec as u64 * 1_000 * NSEC_TO_FRAC) >> 32))
    }

    /// Build from Unix seconds and milliseconds.
    pub fn from_sec_msec(sec: u32, msec: u32) -> Self {
        MsgTime(((sec as u64) << 32) | ((msec as u64 * 1_000_000 * NSEC_TO_FRAC) >> 32))
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => MsgTime::from_sec_nsec(d.as_secs() as u32, d.subsec_nanos()),
            Err(_) => MsgTime(0),
        }
    }

    /// Unix seconds.
    pub fn sec(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Sub-second part in nanoseconds.
    pub fn nsec(self) -> u32 {
        (((self.0 & 0xFFFF_FFFF) * 1_000_000_000 + 0xFFFF_FFFF) >> 32) as u32
    }

    /// Sub-second part in microseconds (floor of the nanosecond value).
    pub fn usec(self) -> u32 {
        self.nsec() / 1_000
    }

    /// Sub-second part in milliseconds (floor of the nanosecond value).
    pub fn msec(self) -> u32 {
        self.nsec() / 1_000_000
    }

    /// Absolute difference between two timestamps in milliseconds.
    pub fn diff_msec(self, other: MsgTime) -> u64 {
        let c = MsgTime(self.0.abs_diff(other.0));
        c.sec() as u64 * 1_000 + c.msec() as u64
    }

    /// Absolute difference between two timestamps in microseconds.
    pub fn diff_usec(self, other: MsgTime) -> u64 {
        let c = MsgTime(self.0.abs_diff(other.0));
        c.sec() as u64 * 1_000_000 + c.usec() as u64
    }

    /// Absolute difference between two timestamps in nanoseconds.
    pub fn diff_nsec(self, other: MsgTime) -> u64 {
        let c = MsgTime(self.0.abs_diff(other.0));
        c.sec() as u64 * 1_000_000_000 + c.nsec() as u64
    }
}

impl std::str::FromStr for MsgTime {
    type Err = Error;

    /// Parse `YYYY-MM-DDTHH:MM:SS[.frac][Z]`, UTC. Fractional digits are
    /// taken up to nanosecond precision; excess digits are truncated and
    /// missing digits are padded with zeros.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.strip_suffix('Z').or_else(|| s.strip_suffix('z')).unwrap_or(s);
        let (head, frac) = match s.split_once('.') {
            Some((head, frac)) => (head, frac),
            None => (s, ""),
        };
        let dt = NaiveDateTime::parse_from_str(head, "%Y-%m-%dT%H:%M:%S")
            .map_err(|e| Error::spec(format!("bad timestamp {:?}: {}", s, e)))?;
        let sec = dt.and_utc().timestamp();
        if !(0..=u32::MAX as i64).contains(&sec) {
            return Err(Error::spec(format!("timestamp {:?} out of range", s)));
        }
        if !frac.is_empty() && !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::spec(format!("bad timestamp fraction {:?}", frac)));
        }
        let mut digits = [b'0'; 9];
        let len = frac.len().min(9);
        digits[..len].copy_from_slice(&frac.as_bytes()[..len]);
        let nsec: u32 = std::str::from_utf8(&digits).unwrap_or("0").parse().unwrap_or(0);
        Ok(MsgTime::from_sec_nsec(sec as u32, nsec))
    }
}

impl std::fmt::Display for MsgTime {
    /// Emit `YYYY-MM-DDTHH:MM:SS.nnnnnnnnn` in UTC with a full nanosecond
    /// fraction, so a formatted timestamp parses back to the same value.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dt = DateTime::from_timestamp(self.sec() as i64, 0).unwrap_or_default();
        write!(f, "{}.{:09}", dt.format("%Y-%m-%dT%H:%M:%S"), self.nsec())
    }
}
