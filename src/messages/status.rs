use std::fmt;

use serde::{Deserialize, Serialize};

/// Job status levels carried in listener messages and persisted records.
///
/// Transitions are monotone within a stage: a job that reaches `Failed`
/// never returns to `Running` for that stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    Exception,
}

impl JobStatus {
    pub fn is_success(self) -> bool {
        matches!(self, JobStatus::Success)
    }

    pub fn is_terminal_failure(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Exception)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Exception => "exception",
        };
        f.write_str(name)
    }
}

/// Notification cadence requested in the job document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    #[default]
    Single,
    Periodic,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_string(&JobStatus::Success).unwrap();
        assert_eq!(json, "\"success\"");

        let status: JobStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(status, JobStatus::Failed);
    }

    #[test]
    fn test_terminal_failure() {
        assert!(JobStatus::Failed.is_terminal_failure());
        assert!(JobStatus::Exception.is_terminal_failure());
        assert!(!JobStatus::Success.is_terminal_failure());
        assert!(!JobStatus::Pending.is_terminal_failure());
    }

    #[test]
    fn test_notification_type_default() {
        assert_eq!(NotificationType::default(), NotificationType::Single);
    }
}
