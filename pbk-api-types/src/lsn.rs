use std::fmt;
use std::str::FromStr;

use anyhow::{bail, format_err, Error};

/// Timeline identifier of the database history.
pub type TimeLineId = u32;

/// Position inside the write ahead log.
///
/// Printed the way the database prints it: high and low 32 bits in hex, separated by a slash.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// Number of the WAL segment containing this position.
    #[inline]
    pub fn segment_number(&self, segment_size: u64) -> u64 {
        self.0 / segment_size
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xffff_ffff)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| format_err!("invalid LSN {s:?} - missing '/'"))?;
        if hi.is_empty() || lo.is_empty() || hi.len() > 8 || lo.len() > 8 {
            bail!("invalid LSN {s:?}");
        }
        let hi = u32::from_str_radix(hi, 16).map_err(|err| format_err!("invalid LSN {s:?} - {err}"))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|err| format_err!("invalid LSN {s:?} - {err}"))?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

serde_plain::derive_deserialize_from_fromstr!(Lsn, "valid LSN (X/X)");
serde_plain::derive_serialize_from_display!(Lsn);
