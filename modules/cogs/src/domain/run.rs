//! Run records and the status state machine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Status of a COGS calculation run.
///
/// ```text
/// pending -> running -> completed -> rolled_back
///               |
///               +-----> failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    /// Whether the run still owns its tenant's pipeline.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "rolled_back" => Ok(Self::RolledBack),
            _ => Err(format!("unknown run status: {s}")),
        }
    }
}

/// Costing mode of a run. Only FIFO today; the tag exists so average costing
/// can be added without a schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Fifo,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" => Ok(Self::Fifo),
            _ => Err(format!("unsupported mode: {s}")),
        }
    }
}

/// Aggregate counters stamped onto a run at commit.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RunCounters {
    pub total_sales_processed: i64,
    pub total_cogs: Decimal,
    pub validation_errors_count: i64,
}

/// One COGS calculation run for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub tenant_id: String,
    pub status: RunStatus,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    pub input_file_id: Option<Uuid>,
    pub created_by: Option<String>,
    pub error_message: Option<String>,
    pub total_sales_processed: i64,
    pub total_cogs: Decimal,
    pub validation_errors_count: i64,
}

impl RunRecord {
    pub fn new(
        run_id: Uuid,
        tenant_id: &str,
        mode: RunMode,
        created_by: Option<String>,
        input_file_id: Option<Uuid>,
    ) -> Self {
        Self {
            run_id,
            tenant_id: tenant_id.to_string(),
            status: RunStatus::Pending,
            mode,
            started_at: Utc::now(),
            completed_at: None,
            rolled_back_at: None,
            input_file_id,
            created_by,
            error_message: None,
            total_sales_processed: 0,
            total_cogs: Decimal::ZERO,
            validation_errors_count: 0,
        }
    }
}

/// Filter for run listings.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub limit: Option<i64>,
}

/// Limit/offset pagination for attribution reads.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 500,
            offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::RolledBack,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::RolledBack.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Running.is_active());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!("avg".parse::<RunMode>().is_err());
        assert_eq!("fifo".parse::<RunMode>().unwrap(), RunMode::Fifo);
    }
}
