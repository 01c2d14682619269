//! Reading quality codes.
//!
//! Quality is assigned by the data processor (see `crate::processor`) and
//! is the single piece of metadata downstream consumers use to decide
//! whether a `processed_value`/`rate` may be trusted.

use serde::{Deserialize, Serialize};

/// Quality verdict attached to every emitted [`crate::reading::DeviceReading`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// Value is within range and, if applicable, within the configured rate.
    #[default]
    Good,

    /// Value is within range but the computed rate exceeded `max_change_rate`.
    Degraded,

    /// Value is outside the configured `min`/`max` bounds.
    Bad,

    /// The underlying read/decode failed; `raw_value` is not meaningful.
    Unavailable,
}

impl Quality {
    /// Good readings (and only good readings) are eligible rate predecessors.
    #[inline]
    pub fn is_good(&self) -> bool {
        matches!(self, Self::Good)
    }

    /// Whether this reading failed outright (no data was obtained).
    #[inline]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Good => "Good",
            Self::Degraded => "Degraded",
            Self::Bad => "Bad",
            Self::Unavailable => "Unavailable",
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
