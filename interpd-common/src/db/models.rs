//! Database row models
//!
//! Enum-valued columns are stored as TEXT and converted through
//! `as_str`/`FromStr` so a bad row surfaces as a corruption error instead
//! of a panic.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Meeting category. `Dr` is the protected category with
/// anti-consecutive-assignment rules; `Other` carries an optional sub-scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingType {
    Dr,
    Other,
}

impl MeetingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeetingType::Dr => "dr",
            MeetingType::Other => "other",
        }
    }
}

impl FromStr for MeetingType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dr" => Ok(MeetingType::Dr),
            "other" => Ok(MeetingType::Other),
            other => Err(Error::Corruption(format!("unknown meeting type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Waiting,
    Approved,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Waiting => "waiting",
            BookingStatus::Approved => "approved",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for BookingStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(BookingStatus::Waiting),
            "approved" => Ok(BookingStatus::Approved),
            "cancelled" => Ok(BookingStatus::Cancelled),
            other => Err(Error::Corruption(format!("unknown booking status: {other}"))),
        }
    }
}

/// A meeting requiring interpretation.
///
/// Invariants: `start_time < end_time`; an approved booking has a non-null
/// interpreter; a cancelled booking is excluded from every conflict and
/// fairness computation at read time.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Booking {
    pub id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub meeting_type: String,
    pub sub_scope: Option<String>,
    pub status: String,
    pub interpreter_id: Option<Uuid>,
    pub owner_id: Uuid,
    pub environment: Option<String>,
    pub chair_id: Option<Uuid>,
    /// Free-text detail; for DR bookings this also carries the sub-type tag
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn meeting_type(&self) -> Result<MeetingType> {
        self.meeting_type.parse()
    }

    pub fn status(&self) -> Result<BookingStatus> {
        self.status.parse()
    }

    pub fn is_dr(&self) -> bool {
        self.meeting_type == "dr"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Interpreter {
    pub id: Uuid,
    pub name: String,
    pub active: bool,
    /// Only rows with the interpreter capability participate in ranking
    pub is_interpreter: bool,
    pub environment: Option<String>,
}

/// Per meeting-type threshold/priority row, optionally scoped to a mode
/// and/or an organizational environment. NULL scope columns mean "default".
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MeetingTypePriority {
    pub id: i64,
    pub meeting_type: String,
    pub priority: f64,
    pub urgent_threshold_days: i64,
    pub general_threshold_days: i64,
    pub mode: Option<String>,
    pub environment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Waiting,
    Ready,
    Processing,
    Failed,
}

impl PoolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolStatus::Waiting => "waiting",
            PoolStatus::Ready => "ready",
            PoolStatus::Processing => "processing",
            PoolStatus::Failed => "failed",
        }
    }
}

impl FromStr for PoolStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(PoolStatus::Waiting),
            "ready" => Ok(PoolStatus::Ready),
            "processing" => Ok(PoolStatus::Processing),
            "failed" => Ok(PoolStatus::Failed),
            other => Err(Error::Corruption(format!("unknown pool status: {other}"))),
        }
    }
}

/// Pooled state of a booking awaiting its decision point.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PoolEntry {
    pub booking_id: Uuid,
    pub entered_at: DateTime<Utc>,
    /// Derived from the booking start and the effective urgent threshold;
    /// an unconditional promotion override regardless of mode
    pub deadline_at: DateTime<Utc>,
    pub mode_at_entry: String,
    pub attempts: i64,
    pub status: String,
    /// Set while `processing`; entries older than the staleness threshold
    /// are considered stuck and eligible for recovery
    pub processing_since: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PoolEntry {
    pub fn status(&self) -> Result<PoolStatus> {
        self.status.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AssignmentLogRow {
    pub id: i64,
    pub event_type: String,
    pub booking_id: Option<Uuid>,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meeting_type_round_trips() {
        assert_eq!(MeetingType::Dr.as_str().parse::<MeetingType>().unwrap(), MeetingType::Dr);
        assert_eq!(
            MeetingType::Other.as_str().parse::<MeetingType>().unwrap(),
            MeetingType::Other
        );
        assert!("committee".parse::<MeetingType>().is_err());
    }

    #[test]
    fn unknown_status_is_corruption() {
        let err = "pending".parse::<BookingStatus>().unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn pool_status_round_trips() {
        for s in [
            PoolStatus::Waiting,
            PoolStatus::Ready,
            PoolStatus::Processing,
            PoolStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<PoolStatus>().unwrap(), s);
        }
    }
}
