// src/models.rs - Domain entities and request/response structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

// ==================== LABORATORY ====================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Laboratory {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub equipment_count: i64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateLaboratoryRequest {
    #[validate(length(min = 1, max = 255, message = "Laboratory name is required"))]
    pub name: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateLaboratoryRequest {
    #[validate(length(min = 1, max = 255, message = "Laboratory name is required"))]
    pub name: String,
}

// ==================== EQUIPMENT ====================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Equipment {
    pub id: String,
    pub lab_id: String,
    pub name: String,
    pub status: String,
    pub total_quantity: i64,
    pub available_quantity: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lab_name: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateEquipmentRequest {
    #[validate(length(min = 1, message = "Laboratory is required"))]
    pub lab_id: String,
    #[validate(length(min = 1, max = 255, message = "Equipment name is required"))]
    pub name: String,
    pub status: Option<String>,
    #[validate(range(min = 1, message = "Total quantity must be at least 1"))]
    pub total_quantity: i64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateEquipmentRequest {
    #[validate(length(min = 1, max = 255, message = "Equipment name is required"))]
    pub name: Option<String>,
    pub lab_id: Option<String>,
    pub status: Option<String>,
    #[validate(range(min = 1, message = "Total quantity must be at least 1"))]
    pub total_quantity: Option<i64>,
}

// ==================== RESERVATION ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Approved,
    Rejected,
    Completed,
    Returned,
    Cancelled,
}

impl ReservationStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(ReservationStatus::Pending),
            "approved" => Some(ReservationStatus::Approved),
            "rejected" => Some(ReservationStatus::Rejected),
            "completed" => Some(ReservationStatus::Completed),
            "returned" => Some(ReservationStatus::Returned),
            "cancelled" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Approved => "approved",
            ReservationStatus::Rejected => "rejected",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Returned => "returned",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    /// Legal status transitions. Pending requests are decided by an admin;
    /// approved loans end by being returned or completed. Everything else is
    /// terminal.
    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Cancelled)
                | (Approved, Returned)
                | (Approved, Completed)
        )
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reservation {
    pub id: String,
    pub user_id: String,
    pub equipment_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: String,
    pub quantity: i64,
    pub reason: String,
    pub admin_notes: Option<String>,
    pub return_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user_name: String,
    pub equipment_name: String,
    pub lab_name: String,
}

impl Reservation {
    pub fn parsed_status(&self) -> ReservationStatus {
        ReservationStatus::from_str(&self.status).unwrap_or(ReservationStatus::Pending)
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateReservationRequest {
    #[validate(length(min = 1, message = "Equipment is required"))]
    pub equipment_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i64,
    #[validate(length(min = 1, message = "Reason is required"))]
    pub reason: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateReservationStatusRequest {
    #[validate(length(min = 1, message = "Status is required"))]
    pub status: String,
    pub admin_notes: Option<String>,
}

/// Half-open interval intersection: two time ranges conflict when each starts
/// before the other ends. Touching endpoints do not conflict.
pub fn overlaps(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    a_start < b_end && b_start < a_end
}

// ==================== ADMIN HISTORY (DERIVED) ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminActionKind {
    Approve,
    Reject,
    Return,
}

impl AdminActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminActionKind::Approve => "approve",
            AdminActionKind::Reject => "reject",
            AdminActionKind::Return => "return",
        }
    }
}

/// One entry of the admin activity log. Never persisted: the log is a pure
/// projection of the reservation collection and is recomputed per request.
#[derive(Debug, Clone, Serialize)]
pub struct AdminAction {
    pub action: AdminActionKind,
    pub reservation_id: String,
    pub equipment_name: String,
    pub user_name: String,
    pub timestamp: DateTime<Utc>,
    pub notes: Option<String>,
}

/// Project reservations into the admin history view, most recent first.
/// Returned loans are dated by their return timestamp, decisions by the
/// reservation start time.
pub fn build_admin_history(reservations: &[Reservation]) -> Vec<AdminAction> {
    let mut history: Vec<AdminAction> = reservations
        .iter()
        .filter_map(|r| {
            let (action, timestamp) = match r.parsed_status() {
                ReservationStatus::Approved => (AdminActionKind::Approve, r.start_time),
                ReservationStatus::Rejected => (AdminActionKind::Reject, r.start_time),
                ReservationStatus::Returned => (
                    AdminActionKind::Return,
                    r.return_timestamp.unwrap_or(r.updated_at),
                ),
                _ => return None,
            };
            Some(AdminAction {
                action,
                reservation_id: r.id.clone(),
                equipment_name: r.equipment_name.clone(),
                user_name: r.user_name.clone(),
                timestamp,
                notes: r.admin_notes.clone(),
            })
        })
        .collect();
    history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    history
}

// ==================== NOTIFICATION ====================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub message: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}
