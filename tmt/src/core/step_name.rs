//! Pipeline step identity and persisted status.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// The six pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepName {
    Discover,
    Provision,
    Prepare,
    Execute,
    Report,
    Finish,
}

impl StepName {
    pub const ALL: [StepName; 6] = [
        StepName::Discover,
        StepName::Provision,
        StepName::Prepare,
        StepName::Execute,
        StepName::Report,
        StepName::Finish,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepName::Discover => "discover",
            StepName::Provision => "provision",
            StepName::Prepare => "prepare",
            StepName::Execute => "execute",
            StepName::Report => "report",
            StepName::Finish => "finish",
        }
    }

    /// Steps from `self` up to and including `until`.
    pub fn range(since: StepName, until: StepName) -> Vec<StepName> {
        Self::ALL
            .into_iter()
            .filter(|step| *step >= since && *step <= until)
            .collect()
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepName {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        StepName::ALL
            .into_iter()
            .find(|step| step.as_str() == value)
            .ok_or_else(|| anyhow!("unknown step '{value}'"))
    }
}

/// Persisted step status. `todo` until every plugin finished successfully.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Todo,
    Done,
}
