// src/reservation_handlers.rs
//! Reservation lifecycle handlers: request, review, return, complete.

use actix_web::{web, HttpResponse};
use chrono::{Duration, Utc};
use log::info;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::error::{ApiError, ApiResult};
use crate::handlers::{search_matches, ApiResponse, ListQuery};
use crate::models::{
    build_admin_history, overlaps, CreateReservationRequest, Reservation, ReservationStatus,
    UpdateReservationStatusRequest,
};
use crate::notification_handlers;
use crate::AppState;

const RESERVATION_SELECT: &str = r#"
    SELECT r.id, r.user_id, r.equipment_id, r.start_time, r.end_time, r.status,
           r.quantity, r.reason, r.admin_notes, r.return_timestamp,
           r.created_at, r.updated_at,
           u.name AS user_name, e.name AS equipment_name, l.name AS lab_name
    FROM reservations r
    JOIN users u ON u.id = r.user_id
    JOIN equipment e ON e.id = r.equipment_id
    JOIN laboratories l ON l.id = e.lab_id
"#;

const RETURN_NOTE_DEFAULT: &str = "Equipment has been returned";

// ==================== PURE VIEW HELPERS ====================

pub fn filter_reservations(reservations: Vec<Reservation>, query: &ListQuery) -> Vec<Reservation> {
    let mut filtered = reservations;
    if let Some(term) = query.search_term() {
        filtered.retain(|r| {
            search_matches(term, &[&r.user_name, &r.equipment_name, &r.lab_name, &r.reason])
        });
    }
    if let Some(status) = query.status.as_deref() {
        filtered.retain(|r| r.status.eq_ignore_ascii_case(status));
    }
    if let Some(lab) = query.laboratory.as_deref() {
        filtered.retain(|r| r.lab_name.eq_ignore_ascii_case(lab));
    }
    filtered
}

pub fn sort_reservations(reservations: &mut [Reservation], query: &ListQuery) {
    match query.sort_by.as_deref() {
        Some("start_time") => reservations.sort_by(|a, b| a.start_time.cmp(&b.start_time)),
        Some("status") => reservations.sort_by(|a, b| a.status.cmp(&b.status)),
        Some("user_name") => reservations.sort_by(|a, b| a.user_name.cmp(&b.user_name)),
        Some("equipment_name") => {
            reservations.sort_by(|a, b| a.equipment_name.cmp(&b.equipment_name))
        }
        _ => reservations.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
    }
    if query.descending() {
        reservations.reverse();
    }
}

async fn fetch_reservation(
    pool: &sqlx::SqlitePool,
    reservation_id: &str,
) -> ApiResult<Reservation> {
    let reservation: Option<Reservation> =
        sqlx::query_as(&format!("{} WHERE r.id = ?", RESERVATION_SELECT))
            .bind(reservation_id)
            .fetch_optional(pool)
            .await?;
    reservation.ok_or_else(|| ApiError::reservation_not_found(reservation_id))
}

// ==================== GET ALL RESERVATIONS ====================

pub async fn get_reservations(
    app_state: web::Data<Arc<AppState>>,
    query: web::Query<ListQuery>,
) -> ApiResult<HttpResponse> {
    let reservations: Vec<Reservation> =
        sqlx::query_as(&format!("{} ORDER BY r.created_at DESC", RESERVATION_SELECT))
            .fetch_all(&app_state.db_pool)
            .await?;

    let mut reservations = filter_reservations(reservations, &query);
    sort_reservations(&mut reservations, &query);

    Ok(HttpResponse::Ok().json(ApiResponse::success(reservations)))
}

// ==================== GET RESERVATIONS FOR ONE USER ====================

pub async fn get_user_reservations(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    query: web::Query<ListQuery>,
) -> ApiResult<HttpResponse> {
    let user_id = path.into_inner();
    let reservations: Vec<Reservation> = sqlx::query_as(&format!(
        "{} WHERE r.user_id = ? ORDER BY r.created_at DESC",
        RESERVATION_SELECT
    ))
    .bind(&user_id)
    .fetch_all(&app_state.db_pool)
    .await?;

    let mut reservations = filter_reservations(reservations, &query);
    sort_reservations(&mut reservations, &query);

    Ok(HttpResponse::Ok().json(ApiResponse::success(reservations)))
}

// ==================== CREATE RESERVATION ====================

pub async fn create_reservation(
    app_state: web::Data<Arc<AppState>>,
    user_id: String,
    request: web::Json<CreateReservationRequest>,
) -> ApiResult<HttpResponse> {
    request.validate()?;
    crate::error::validate_quantity(request.quantity)?;
    crate::error::validate_time_range(request.start_time, request.end_time)?;

    if request.reason.trim().is_empty() {
        return Err(ApiError::bad_request("A reason for the reservation is required"));
    }

    // Allow one minute of clock skew between client and server.
    if request.start_time < Utc::now() - Duration::minutes(1) {
        return Err(ApiError::bad_request("Reservation cannot start in the past"));
    }

    let mut tx = app_state.db_pool.begin().await?;

    let equipment: Option<(String, i64)> =
        sqlx::query_as("SELECT name, total_quantity FROM equipment WHERE id = ?")
            .bind(&request.equipment_id)
            .fetch_optional(&mut *tx)
            .await?;
    let (equipment_name, total_quantity) =
        equipment.ok_or_else(|| ApiError::equipment_not_found(&request.equipment_id))?;

    if request.quantity > total_quantity {
        return Err(ApiError::insufficient_quantity(total_quantity, request.quantity));
    }

    // Every pending or approved reservation whose window intersects the
    // requested one counts against the total stock.
    let active: Vec<(chrono::DateTime<Utc>, chrono::DateTime<Utc>, i64)> = sqlx::query_as(
        "SELECT start_time, end_time, quantity FROM reservations \
         WHERE equipment_id = ? AND status IN ('pending', 'approved')",
    )
    .bind(&request.equipment_id)
    .fetch_all(&mut *tx)
    .await?;

    let committed: i64 = active
        .iter()
        .filter(|(start, end, _)| overlaps(request.start_time, request.end_time, *start, *end))
        .map(|(_, _, qty)| qty)
        .sum();

    if committed + request.quantity > total_quantity {
        return Err(ApiError::reservation_conflict());
    }

    let id = Uuid::new_v4().to_string();
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO reservations
            (id, user_id, equipment_id, start_time, end_time, status, quantity, reason, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&user_id)
    .bind(&request.equipment_id)
    .bind(request.start_time)
    .bind(request.end_time)
    .bind(request.quantity)
    .bind(request.reason.trim())
    .bind(&now)
    .bind(&now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    let created = fetch_reservation(&app_state.db_pool, &id).await?;
    info!(
        "📅 Reservation requested: {} x{} by {} ({})",
        equipment_name, request.quantity, created.user_name, id
    );
    Ok(HttpResponse::Created().json(ApiResponse::success(created)))
}

// ==================== UPDATE RESERVATION STATUS ====================

pub async fn update_reservation_status(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    request: web::Json<UpdateReservationStatusRequest>,
) -> ApiResult<HttpResponse> {
    request.validate()?;
    let reservation_id = path.into_inner();

    let next = ReservationStatus::from_str(&request.status)
        .ok_or_else(|| ApiError::bad_request(&format!("Unknown status: {}", request.status)))?;

    if next == ReservationStatus::Rejected
        && request
            .admin_notes
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .is_empty()
    {
        return Err(ApiError::bad_request("A reason is required when rejecting a reservation"));
    }

    let mut tx = app_state.db_pool.begin().await?;

    let current: Option<(String, String, i64, String)> = sqlx::query_as(
        "SELECT user_id, equipment_id, quantity, status FROM reservations WHERE id = ?",
    )
    .bind(&reservation_id)
    .fetch_optional(&mut *tx)
    .await?;
    let (owner_id, equipment_id, quantity, current_status) =
        current.ok_or_else(|| ApiError::reservation_not_found(&reservation_id))?;

    let current_status = ReservationStatus::from_str(&current_status)
        .ok_or_else(|| ApiError::InternalServerError("Corrupt reservation status".to_string()))?;

    if !current_status.can_transition_to(next) {
        return Err(ApiError::invalid_transition(current_status.as_str(), next.as_str()));
    }

    let now = Utc::now();

    // Stock moves with the status: approval debits, handing back credits.
    match next {
        ReservationStatus::Approved => {
            let (available,): (i64,) =
                sqlx::query_as("SELECT available_quantity FROM equipment WHERE id = ?")
                    .bind(&equipment_id)
                    .fetch_one(&mut *tx)
                    .await?;
            if available < quantity {
                return Err(ApiError::insufficient_quantity(available, quantity));
            }
            sqlx::query(
                "UPDATE equipment SET available_quantity = available_quantity - ?, updated_at = ? WHERE id = ?",
            )
            .bind(quantity)
            .bind(now)
            .bind(&equipment_id)
            .execute(&mut *tx)
            .await?;
        }
        ReservationStatus::Returned | ReservationStatus::Completed => {
            sqlx::query(
                "UPDATE equipment SET available_quantity = available_quantity + ?, updated_at = ? WHERE id = ?",
            )
            .bind(quantity)
            .bind(now)
            .bind(&equipment_id)
            .execute(&mut *tx)
            .await?;
        }
        _ => {}
    }

    let admin_notes = match next {
        ReservationStatus::Returned => Some(
            request
                .admin_notes
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| RETURN_NOTE_DEFAULT.to_string()),
        ),
        _ => request.admin_notes.clone().filter(|n| !n.trim().is_empty()),
    };
    let return_timestamp = matches!(next, ReservationStatus::Returned).then_some(now);

    sqlx::query(
        r#"
        UPDATE reservations
        SET status = ?, admin_notes = COALESCE(?, admin_notes),
            return_timestamp = COALESCE(?, return_timestamp), updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(next.as_str())
    .bind(&admin_notes)
    .bind(return_timestamp)
    .bind(now)
    .bind(&reservation_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    let updated = fetch_reservation(&app_state.db_pool, &reservation_id).await?;
    notify_owner(&app_state, &owner_id, &updated, next).await;

    info!(
        "📅 Reservation {} -> {}: {} for {}",
        reservation_id, next, updated.equipment_name, updated.user_name
    );
    Ok(HttpResponse::Ok().json(ApiResponse::success(updated)))
}

async fn notify_owner(
    app_state: &web::Data<Arc<AppState>>,
    owner_id: &str,
    reservation: &Reservation,
    status: ReservationStatus,
) {
    let message = match status {
        ReservationStatus::Approved => {
            format!("Your reservation for {} has been approved", reservation.equipment_name)
        }
        ReservationStatus::Rejected => format!(
            "Your reservation for {} has been rejected: {}",
            reservation.equipment_name,
            reservation.admin_notes.as_deref().unwrap_or("no reason given")
        ),
        ReservationStatus::Returned => {
            format!("Your loan of {} has been marked as returned", reservation.equipment_name)
        }
        ReservationStatus::Completed => {
            format!("Your reservation for {} has been completed", reservation.equipment_name)
        }
        _ => return,
    };
    notification_handlers::record(&app_state.db_pool, owner_id, &message).await;
}

// ==================== CANCEL RESERVATION (OWNER) ====================

pub async fn cancel_reservation(
    app_state: web::Data<Arc<AppState>>,
    user_id: String,
    path: web::Path<String>,
) -> ApiResult<HttpResponse> {
    let reservation_id = path.into_inner();

    let mut tx = app_state.db_pool.begin().await?;

    let current: Option<(String, String)> =
        sqlx::query_as("SELECT user_id, status FROM reservations WHERE id = ?")
            .bind(&reservation_id)
            .fetch_optional(&mut *tx)
            .await?;
    let (owner_id, status) =
        current.ok_or_else(|| ApiError::reservation_not_found(&reservation_id))?;

    if owner_id != user_id {
        return Err(ApiError::Forbidden(
            "Only the requesting student can cancel a reservation".to_string(),
        ));
    }

    let current_status = ReservationStatus::from_str(&status)
        .ok_or_else(|| ApiError::InternalServerError("Corrupt reservation status".to_string()))?;
    if !current_status.can_transition_to(ReservationStatus::Cancelled) {
        return Err(ApiError::invalid_transition(current_status.as_str(), "cancelled"));
    }

    sqlx::query("UPDATE reservations SET status = 'cancelled', updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(&reservation_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    let updated = fetch_reservation(&app_state.db_pool, &reservation_id).await?;
    info!("📅 Reservation cancelled by owner: {}", reservation_id);
    Ok(HttpResponse::Ok().json(ApiResponse::success(updated)))
}

// ==================== COMPLETE RESERVATION ====================

pub async fn complete_reservation(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> ApiResult<HttpResponse> {
    let reservation_id = path.into_inner();
    let request = web::Json(UpdateReservationStatusRequest {
        status: "completed".to_string(),
        admin_notes: None,
    });
    update_reservation_status(app_state, web::Path::from(reservation_id), request).await
}

// ==================== ADMIN HISTORY ====================

pub async fn get_reservation_history(
    app_state: web::Data<Arc<AppState>>,
    query: web::Query<ListQuery>,
) -> ApiResult<HttpResponse> {
    let reservations: Vec<Reservation> =
        sqlx::query_as(&format!("{} ORDER BY r.created_at DESC", RESERVATION_SELECT))
            .fetch_all(&app_state.db_pool)
            .await?;

    let mut history = build_admin_history(&reservations);
    if let Some(term) = query.search_term() {
        history.retain(|a| {
            search_matches(term, &[a.action.as_str(), &a.equipment_name, &a.user_name])
        });
    }

    Ok(HttpResponse::Ok().json(ApiResponse::success(history)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use sqlx::SqlitePool;

    async fn seed_user(pool: &SqlitePool, id: &str, name: &str, role: &str) {
        sqlx::query(
            "INSERT INTO users (id, name, email, password_hash, role, is_active, created_at, updated_at) \
             VALUES (?, ?, ?, 'x', ?, 1, ?, ?)",
        )
        .bind(id)
        .bind(name)
        .bind(format!("{}@example.com", id))
        .bind(role)
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(pool)
        .await
        .unwrap();
    }

    async fn seed_equipment(pool: &SqlitePool, id: &str, name: &str, total: i64) {
        sqlx::query("INSERT INTO laboratories (id, name, created_at, updated_at) VALUES (?, ?, ?, ?)")
            .bind(format!("lab-{}", id))
            .bind(format!("Lab for {}", name))
            .bind(Utc::now())
            .bind(Utc::now())
            .execute(pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO equipment (id, lab_id, name, status, total_quantity, available_quantity, created_at, updated_at) \
             VALUES (?, ?, ?, 'operational', ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(format!("lab-{}", id))
        .bind(name)
        .bind(total)
        .bind(total)
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(pool)
        .await
        .unwrap();
    }

    fn state(pool: SqlitePool) -> web::Data<Arc<AppState>> {
        web::Data::new(Arc::new(AppState::for_tests(pool)))
    }

    fn request_for(equipment_id: &str, quantity: i64, hours_from_now: i64) -> web::Json<CreateReservationRequest> {
        let start = Utc::now() + Duration::hours(hours_from_now);
        web::Json(CreateReservationRequest {
            equipment_id: equipment_id.to_string(),
            start_time: start,
            end_time: start + Duration::hours(2),
            quantity,
            reason: "Coursework experiment".to_string(),
        })
    }

    async fn latest_reservation_id(pool: &SqlitePool) -> String {
        let (id,): (String,) =
            sqlx::query_as("SELECT id FROM reservations ORDER BY created_at DESC, rowid DESC LIMIT 1")
                .fetch_one(pool)
                .await
                .unwrap();
        id
    }

    async fn available(pool: &SqlitePool, equipment_id: &str) -> i64 {
        let (n,): (i64,) = sqlx::query_as("SELECT available_quantity FROM equipment WHERE id = ?")
            .bind(equipment_id)
            .fetch_one(pool)
            .await
            .unwrap();
        n
    }

    #[actix_rt::test]
    async fn approval_debits_and_return_credits_stock() {
        let pool = test_pool().await;
        let state = state(pool.clone());
        seed_user(&pool, "stu", "Ada", "student").await;
        seed_equipment(&pool, "eq1", "Oscilloscope", 3).await;

        create_reservation(state.clone(), "stu".to_string(), request_for("eq1", 2, 1))
            .await
            .unwrap();
        let id = latest_reservation_id(&pool).await;
        assert_eq!(available(&pool, "eq1").await, 3);

        update_reservation_status(
            state.clone(),
            web::Path::from(id.clone()),
            web::Json(UpdateReservationStatusRequest {
                status: "approved".to_string(),
                admin_notes: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(available(&pool, "eq1").await, 1);

        update_reservation_status(
            state.clone(),
            web::Path::from(id.clone()),
            web::Json(UpdateReservationStatusRequest {
                status: "returned".to_string(),
                admin_notes: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(available(&pool, "eq1").await, 3);

        let row = fetch_reservation(&pool, &id).await.unwrap();
        assert_eq!(row.admin_notes.as_deref(), Some(RETURN_NOTE_DEFAULT));
        assert!(row.return_timestamp.is_some());
    }

    #[actix_rt::test]
    async fn overlapping_demand_beyond_stock_is_refused() {
        let pool = test_pool().await;
        let state = state(pool.clone());
        seed_user(&pool, "stu", "Ada", "student").await;
        seed_equipment(&pool, "eq1", "Centrifuge", 2).await;

        create_reservation(state.clone(), "stu".to_string(), request_for("eq1", 2, 1))
            .await
            .unwrap();

        // Same window, stock exhausted by the pending request.
        let conflict =
            create_reservation(state.clone(), "stu".to_string(), request_for("eq1", 1, 1)).await;
        assert!(conflict.is_err());

        // A disjoint window is fine.
        create_reservation(state, "stu".to_string(), request_for("eq1", 2, 10))
            .await
            .unwrap();
    }

    #[actix_rt::test]
    async fn start_in_the_past_is_refused() {
        let pool = test_pool().await;
        let state = state(pool.clone());
        seed_user(&pool, "stu", "Ada", "student").await;
        seed_equipment(&pool, "eq1", "Microscope", 1).await;

        let past =
            create_reservation(state.clone(), "stu".to_string(), request_for("eq1", 1, -2)).await;
        assert!(past.is_err());

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM reservations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[actix_rt::test]
    async fn unknown_status_string_is_refused() {
        let pool = test_pool().await;
        let state = state(pool.clone());
        seed_user(&pool, "stu", "Ada", "student").await;
        seed_equipment(&pool, "eq1", "Microscope", 1).await;

        create_reservation(state.clone(), "stu".to_string(), request_for("eq1", 1, 1))
            .await
            .unwrap();
        let id = latest_reservation_id(&pool).await;

        let unknown = update_reservation_status(
            state,
            web::Path::from(id.clone()),
            web::Json(UpdateReservationStatusRequest {
                status: "borrowed".to_string(),
                admin_notes: None,
            }),
        )
        .await;
        assert!(unknown.is_err());

        let row = fetch_reservation(&pool, &id).await.unwrap();
        assert_eq!(row.status, "pending");
    }

    #[actix_rt::test]
    async fn rejecting_without_a_reason_is_refused() {
        let pool = test_pool().await;
        let state = state(pool.clone());
        seed_user(&pool, "stu", "Ada", "student").await;
        seed_equipment(&pool, "eq1", "Microscope", 1).await;

        create_reservation(state.clone(), "stu".to_string(), request_for("eq1", 1, 1))
            .await
            .unwrap();
        let id = latest_reservation_id(&pool).await;

        let blank = update_reservation_status(
            state.clone(),
            web::Path::from(id.clone()),
            web::Json(UpdateReservationStatusRequest {
                status: "rejected".to_string(),
                admin_notes: Some("   ".to_string()),
            }),
        )
        .await;
        assert!(blank.is_err());

        update_reservation_status(
            state,
            web::Path::from(id.clone()),
            web::Json(UpdateReservationStatusRequest {
                status: "rejected".to_string(),
                admin_notes: Some("Out for calibration".to_string()),
            }),
        )
        .await
        .unwrap();

        let row = fetch_reservation(&pool, &id).await.unwrap();
        assert_eq!(row.status, "rejected");
        // Rejection never touched stock.
        assert_eq!(available(&pool, "eq1").await, 1);
    }

    #[actix_rt::test]
    async fn terminal_states_refuse_further_transitions() {
        let pool = test_pool().await;
        let state = state(pool.clone());
        seed_user(&pool, "stu", "Ada", "student").await;
        seed_equipment(&pool, "eq1", "Spectrometer", 1).await;

        create_reservation(state.clone(), "stu".to_string(), request_for("eq1", 1, 1))
            .await
            .unwrap();
        let id = latest_reservation_id(&pool).await;

        // pending cannot jump straight to returned
        let skip = update_reservation_status(
            state.clone(),
            web::Path::from(id.clone()),
            web::Json(UpdateReservationStatusRequest {
                status: "returned".to_string(),
                admin_notes: None,
            }),
        )
        .await;
        assert!(skip.is_err());

        cancel_reservation(state.clone(), "stu".to_string(), web::Path::from(id.clone()))
            .await
            .unwrap();

        let after_cancel = update_reservation_status(
            state,
            web::Path::from(id),
            web::Json(UpdateReservationStatusRequest {
                status: "approved".to_string(),
                admin_notes: None,
            }),
        )
        .await;
        assert!(after_cancel.is_err());
    }

    #[actix_rt::test]
    async fn cancel_is_owner_only() {
        let pool = test_pool().await;
        let state = state(pool.clone());
        seed_user(&pool, "stu", "Ada", "student").await;
        seed_user(&pool, "other", "Grace", "student").await;
        seed_equipment(&pool, "eq1", "Laser", 1).await;

        create_reservation(state.clone(), "stu".to_string(), request_for("eq1", 1, 1))
            .await
            .unwrap();
        let id = latest_reservation_id(&pool).await;

        let forbidden =
            cancel_reservation(state, "other".to_string(), web::Path::from(id)).await;
        assert!(forbidden.is_err());
    }

    #[actix_rt::test]
    async fn history_projects_decisions_and_returns() {
        let pool = test_pool().await;
        let state = state(pool.clone());
        seed_user(&pool, "stu", "Ada", "student").await;
        seed_equipment(&pool, "eq1", "Oscilloscope", 2).await;

        create_reservation(state.clone(), "stu".to_string(), request_for("eq1", 1, 1))
            .await
            .unwrap();
        let id = latest_reservation_id(&pool).await;
        update_reservation_status(
            state.clone(),
            web::Path::from(id.clone()),
            web::Json(UpdateReservationStatusRequest {
                status: "approved".to_string(),
                admin_notes: None,
            }),
        )
        .await
        .unwrap();

        let reservations: Vec<Reservation> =
            sqlx::query_as(&format!("{} ", RESERVATION_SELECT))
                .fetch_all(&pool)
                .await
                .unwrap();
        let history = build_admin_history(&reservations);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].equipment_name, "Oscilloscope");
        assert_eq!(history[0].user_name, "Ada");
    }
}
