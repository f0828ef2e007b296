use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::search::SearchKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Email,
    Domain,
    Phone,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Email => "email",
            TargetKind::Domain => "domain",
            TargetKind::Phone => "phone",
        }
    }

    pub fn search_kind(&self) -> SearchKind {
        match self {
            TargetKind::Email => SearchKind::Email,
            TargetKind::Domain => SearchKind::Domain,
            TargetKind::Phone => SearchKind::Phone,
        }
    }
}

impl FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(TargetKind::Email),
            "domain" => Ok(TargetKind::Domain),
            "phone" => Ok(TargetKind::Phone),
            other => Err(format!("unknown target kind '{other}'")),
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Scanning,
    Clean,
    Exposed,
    Failed,
    /// The owner's plan no longer includes monitoring.
    Paused,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Scanning => "scanning",
            ScanStatus::Clean => "clean",
            ScanStatus::Exposed => "exposed",
            ScanStatus::Failed => "failed",
            ScanStatus::Paused => "paused",
        }
    }
}

impl FromStr for ScanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ScanStatus::Pending),
            "scanning" => Ok(ScanStatus::Scanning),
            "clean" => Ok(ScanStatus::Clean),
            "exposed" => Ok(ScanStatus::Exposed),
            "failed" => Ok(ScanStatus::Failed),
            "paused" => Ok(ScanStatus::Paused),
            other => Err(format!("unknown scan status '{other}'")),
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoringTarget {
    pub id: Uuid,
    #[serde(skip_serializing)]
    pub user_sub: String,
    pub kind: TargetKind,
    pub value: String,
    pub status: ScanStatus,
    pub findings: i32,
    pub last_error: Option<String>,
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// How a scan ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Findings(usize),
    Failed(String),
    /// Skipped because the owner lost the monitoring feature. Keeps the
    /// previous finding count.
    Paused,
}

impl ScanOutcome {
    pub fn status(&self) -> ScanStatus {
        match self {
            ScanOutcome::Findings(0) => ScanStatus::Clean,
            ScanOutcome::Findings(_) => ScanStatus::Exposed,
            ScanOutcome::Failed(_) => ScanStatus::Failed,
            ScanOutcome::Paused => ScanStatus::Paused,
        }
    }

    /// `None` leaves the stored count untouched.
    pub fn findings(&self) -> Option<i32> {
        match self {
            ScanOutcome::Findings(n) => Some(i32::try_from(*n).unwrap_or(i32::MAX)),
            ScanOutcome::Failed(_) => Some(0),
            ScanOutcome::Paused => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ScanOutcome::Failed(e) => Some(e),
            ScanOutcome::Findings(_) | ScanOutcome::Paused => None,
        }
    }
}

/// Raw `monitoring_targets` row.
#[derive(Debug, Clone, FromRow)]
pub struct TargetRow {
    pub id: Uuid,
    pub user_sub: String,
    pub kind: String,
    pub value: String,
    pub status: String,
    pub findings: i32,
    pub last_error: Option<String>,
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TargetRow> for MonitoringTarget {
    type Error = anyhow::Error;

    fn try_from(row: TargetRow) -> Result<Self, Self::Error> {
        Ok(MonitoringTarget {
            kind: row.kind.parse::<TargetKind>().map_err(anyhow::Error::msg)?,
            status: row.status.parse::<ScanStatus>().map_err(anyhow::Error::msg)?,
            id: row.id,
            user_sub: row.user_sub,
            value: row.value,
            findings: row.findings,
            last_error: row.last_error,
            last_scanned_at: row.last_scanned_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTargetRequest {
    pub kind: TargetKind,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_status() {
        assert_eq!(ScanOutcome::Findings(0).status(), ScanStatus::Clean);
        assert_eq!(ScanOutcome::Findings(3).status(), ScanStatus::Exposed);
        assert_eq!(ScanOutcome::Findings(3).findings(), Some(3));
        let failed = ScanOutcome::Failed("boom".into());
        assert_eq!(failed.status(), ScanStatus::Failed);
        assert_eq!(failed.error(), Some("boom"));
        assert_eq!(ScanOutcome::Paused.status(), ScanStatus::Paused);
        assert_eq!(ScanOutcome::Paused.findings(), None);
    }

    #[test]
    fn test_row_conversion_rejects_unknown_kind() {
        let row = TargetRow {
            id: Uuid::new_v4(),
            user_sub: "auth0|u".into(),
            kind: "fax".into(),
            value: "123".into(),
            status: "pending".into(),
            findings: 0,
            last_error: None,
            last_scanned_at: None,
            created_at: Utc::now(),
        };
        assert!(MonitoringTarget::try_from(row.clone()).is_err());
        let ok = TargetRow {
            kind: "phone".into(),
            ..row
        };
        assert_eq!(
            MonitoringTarget::try_from(ok).unwrap().kind,
            TargetKind::Phone
        );
    }
}
