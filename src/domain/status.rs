use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status shared by pipelines and builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Created,
    WaitingForResource,
    Preparing,
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
    Skipped,
    Manual,
    Scheduled,
}

impl Status {
    /// Statuses of work that has been requested and not yet finished.
    pub const ALIVE: [Status; 5] = [
        Status::Created,
        Status::WaitingForResource,
        Status::Preparing,
        Status::Pending,
        Status::Running,
    ];

    /// Statuses after which nothing else happens to the record.
    pub const COMPLETED: [Status; 4] = [
        Status::Success,
        Status::Failed,
        Status::Canceled,
        Status::Skipped,
    ];

    pub fn is_alive(self) -> bool {
        Self::ALIVE.contains(&self)
    }

    pub fn is_alive_or_scheduled(self) -> bool {
        self.is_alive() || self == Status::Scheduled
    }

    /// Whether `cancel_running` may move this status to `canceled`.
    pub fn is_cancelable(self) -> bool {
        self.is_alive_or_scheduled()
    }

    pub fn is_completed(self) -> bool {
        Self::COMPLETED.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::WaitingForResource => "waiting_for_resource",
            Status::Preparing => "preparing",
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Success => "success",
            Status::Failed => "failed",
            Status::Canceled => "canceled",
            Status::Skipped => "skipped",
            Status::Manual => "manual",
            Status::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
