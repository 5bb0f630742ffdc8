use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FedCkaError;

/// A named training objective that contributes one loss (and optionally one
/// gradient set) per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LossTask {
    /// Main-task cross entropy on clean inputs
    Normal,
    /// Cross entropy on trigger-stamped inputs relabelled to the backdoor label
    Backdoor,
}

impl LossTask {
    pub const ALL: [LossTask; 2] = [LossTask::Normal, LossTask::Backdoor];

    pub fn as_str(&self) -> &'static str {
        match self {
            LossTask::Normal => "normal",
            LossTask::Backdoor => "backdoor",
        }
    }
}

impl fmt::Display for LossTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LossTask {
    type Err = FedCkaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LossTask::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| FedCkaError::UnknownTask(s.to_string()))
    }
}

impl TryFrom<String> for LossTask {
    type Error = FedCkaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LossTask> for String {
    fn from(task: LossTask) -> Self {
        task.as_str().to_string()
    }
}
