//! Request prioritization.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Priority level for scheduled requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    /// Number of priority levels.
    pub const LEVELS: usize = 4;

    /// All levels, highest first (dequeue scan order).
    pub const DESCENDING: [Priority; Self::LEVELS] =
        [Self::Critical, Self::High, Self::Normal, Self::Low];

    /// Index into per-level arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Next-lower level, the source of requests aged into this one.
    pub fn demoted(self) -> Option<Self> {
        match self {
            Self::Critical => Some(Self::High),
            Self::High => Some(Self::Normal),
            Self::Normal => Some(Self::Low),
            Self::Low => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Low,
            1 => Self::Normal,
            2 => Self::High,
            _ => Self::Critical,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}
