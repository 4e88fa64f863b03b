//! Pipeline stage and job priority.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Progress of a job through the processing pipeline.
///
/// `0` is pending/queued, `1..=4` are milestones reported by the external
/// processor (opaque here beyond their ordering), `5` is complete.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Stage(u8);

impl Stage {
    pub const PENDING: Stage = Stage(0);
    pub const COMPLETE: Stage = Stage(5);

    pub fn new(value: i64) -> Result<Self, DomainError> {
        if (0..=5).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(DomainError::StageOutOfRange(value))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_complete(self) -> bool {
        self == Self::COMPLETE
    }
}

impl TryFrom<i64> for Stage {
    type Error = DomainError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Stage> for i64 {
    fn from(value: Stage) -> Self {
        value.0 as i64
    }
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl core::str::FromStr for Stage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: i64 = s
            .trim()
            .parse()
            .map_err(|_| DomainError::validation(format!("stage is not an integer: {s:?}")))?;
        Self::new(value)
    }
}

/// Dispatch priority. Only affects the broker message priority field.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

impl Priority {
    /// AMQP `priority` property for this level.
    pub fn message_priority(self) -> u8 {
        match self {
            Priority::Normal => 0,
            Priority::High => 1,
        }
    }
}
