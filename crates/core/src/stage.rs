//! Processing stages.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A discrete processing step with its own queue and worker pool.
///
/// The set is closed: every stage maps to exactly one handler contract
/// (see [`crate::handler`]).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Stt,
    Summary,
    Postprocess,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 3] = [Stage::Stt, Stage::Summary, Stage::Postprocess];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Stt => "stt",
            Stage::Summary => "summary",
            Stage::Postprocess => "postprocess",
        }
    }

    /// The stage that follows this one, or `None` for the last stage.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Stt => Some(Stage::Summary),
            Stage::Summary => Some(Stage::Postprocess),
            Stage::Postprocess => None,
        }
    }

    pub fn first() -> Stage {
        Stage::Stt
    }

    pub fn is_last(&self) -> bool {
        self.next().is_none()
    }

    /// This stage and every stage after it, in order.
    pub fn downstream_inclusive(&self) -> impl Iterator<Item = Stage> + '_ {
        Stage::ALL.into_iter().filter(move |s| s >= self)
    }
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stt" => Ok(Stage::Stt),
            "summary" => Ok(Stage::Summary),
            "postprocess" => Ok(Stage::Postprocess),
            other => Err(DomainError::invalid_id(format!("unknown stage '{other}'"))),
        }
    }
}
