use std::fmt;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// Lock modes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Read only access, any number of holders.
    Shared,
    /// Modifying access, excludes every other holder.
    Exclusive,
}

impl LockMode {
    /// Single character used as lock file name suffix.
    pub const fn suffix(self) -> char {
        match self {
            LockMode::Shared => 'r',
            LockMode::Exclusive => 'w',
        }
    }

    pub fn from_suffix(suffix: &str) -> Result<Self, Error> {
        Ok(match suffix {
            "r" => LockMode::Shared,
            "w" => LockMode::Exclusive,
            _ => bail!("invalid lock mode suffix {suffix:?}"),
        })
    }

    /// Two claims conflict unless both are shared.
    #[inline]
    pub fn conflicts_with(self, other: LockMode) -> bool {
        self == LockMode::Exclusive || other == LockMode::Exclusive
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockMode::Shared => "shared",
            LockMode::Exclusive => "exclusive",
        })
    }
}
