//! Closed vocabularies: priority queues, periodic job types, result statuses.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// One of the fixed priority classes.
///
/// Workers consume queues in the order of [`QueueName::PRIORITY`]; the first
/// queue with a ready member wins every pop.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    High,
    Default,
    Low,
    Mail,
}

impl QueueName {
    /// All queues, highest priority first.
    pub const PRIORITY: [QueueName; 4] = [
        QueueName::High,
        QueueName::Default,
        QueueName::Low,
        QueueName::Mail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::High => "high",
            QueueName::Default => "default",
            QueueName::Low => "low",
            QueueName::Mail => "mail",
        }
    }
}

impl Default for QueueName {
    fn default() -> Self {
        Self::Default
    }
}

impl core::fmt::Display for QueueName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::PRIORITY
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| {
                DomainError::validation(format!(
                    "unknown queue '{s}' (expected one of: high, default, low, mail)"
                ))
            })
    }
}

/// Kind of periodic job. Ad hoc jobs carry no job type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Cron,
    Interval,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Cron => "cron",
            JobType::Interval => "interval",
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded in the result ledger.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
    Cancelled,
}

impl ResultStatus {
    pub const ALL: [ResultStatus; 3] = [
        ResultStatus::Success,
        ResultStatus::Failure,
        ResultStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Success => "success",
            ResultStatus::Failure => "failure",
            ResultStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal outcomes consume the job payload; a cancelled job is requeued.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResultStatus::Success | ResultStatus::Failure)
    }
}

impl core::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResultStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown result status '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_parse_in_priority_order() {
        let parsed: Vec<QueueName> = ["high", "default", "low", "mail"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(parsed, QueueName::PRIORITY.to_vec());
    }

    #[test]
    fn unknown_queue_is_a_validation_error() {
        let err = "urgent".parse::<QueueName>().unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert!(err.to_string().contains("urgent"));
    }

    #[test]
    fn only_success_and_failure_are_terminal() {
        assert!(ResultStatus::Success.is_terminal());
        assert!(ResultStatus::Failure.is_terminal());
        assert!(!ResultStatus::Cancelled.is_terminal());
    }

    #[test]
    fn serde_uses_lowercase_names() {
        assert_eq!(serde_json::to_string(&QueueName::Mail).unwrap(), "\"mail\"");
        assert_eq!(serde_json::to_string(&JobType::Interval).unwrap(), "\"interval\"");
        assert_eq!(
            serde_json::to_string(&ResultStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }
}
