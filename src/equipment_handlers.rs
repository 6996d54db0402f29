// src/equipment_handlers.rs
//! Equipment inventory handlers

use actix_web::{web, HttpResponse};
use chrono::Utc;
use log::info;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::error::{ApiError, ApiResult};
use crate::handlers::{search_matches, ApiResponse, ListQuery};
use crate::models::{CreateEquipmentRequest, Equipment, UpdateEquipmentRequest};
use crate::AppState;

const EQUIPMENT_SELECT: &str = r#"
    SELECT e.id, e.lab_id, e.name, e.status, e.total_quantity, e.available_quantity,
           e.created_at, e.updated_at, l.name AS lab_name
    FROM equipment e
    JOIN laboratories l ON l.id = e.lab_id
"#;

// ==================== PURE VIEW HELPERS ====================

pub fn filter_equipment(items: Vec<Equipment>, query: &ListQuery) -> Vec<Equipment> {
    let mut filtered = items;
    if let Some(term) = query.search_term() {
        filtered.retain(|e| search_matches(term, &[&e.name, &e.lab_name]));
    }
    if let Some(status) = query.status.as_deref() {
        filtered.retain(|e| e.status.eq_ignore_ascii_case(status));
    }
    if let Some(lab) = query.laboratory.as_deref() {
        filtered.retain(|e| e.lab_name.eq_ignore_ascii_case(lab) || e.lab_id == lab);
    }
    filtered
}

pub fn sort_equipment(items: &mut [Equipment], query: &ListQuery) {
    match query.sort_by.as_deref() {
        Some("lab_name") => items.sort_by(|a, b| a.lab_name.cmp(&b.lab_name)),
        Some("status") => items.sort_by(|a, b| a.status.cmp(&b.status)),
        Some("total_quantity") => items.sort_by(|a, b| a.total_quantity.cmp(&b.total_quantity)),
        Some("available_quantity") => {
            items.sort_by(|a, b| a.available_quantity.cmp(&b.available_quantity))
        }
        Some("created_at") => items.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        _ => items.sort_by(|a, b| a.name.cmp(&b.name)),
    }
    if query.descending() {
        items.reverse();
    }
}

// ==================== GET ALL EQUIPMENT ====================

pub async fn get_equipment(
    app_state: web::Data<Arc<AppState>>,
    query: web::Query<ListQuery>,
) -> ApiResult<HttpResponse> {
    let items: Vec<Equipment> =
        sqlx::query_as(&format!("{} ORDER BY e.name ASC", EQUIPMENT_SELECT))
            .fetch_all(&app_state.db_pool)
            .await?;

    let mut items = filter_equipment(items, &query);
    sort_equipment(&mut items, &query);

    Ok(HttpResponse::Ok().json(ApiResponse::success(items)))
}

// ==================== GET EQUIPMENT BY ID ====================

pub async fn get_equipment_by_id(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> ApiResult<HttpResponse> {
    let equipment_id = path.into_inner();
    let item: Option<Equipment> =
        sqlx::query_as(&format!("{} WHERE e.id = ?", EQUIPMENT_SELECT))
            .bind(&equipment_id)
            .fetch_optional(&app_state.db_pool)
            .await?;

    match item {
        Some(item) => Ok(HttpResponse::Ok().json(ApiResponse::success(item))),
        None => Err(ApiError::equipment_not_found(&equipment_id)),
    }
}

// ==================== CREATE EQUIPMENT ====================

pub async fn create_equipment(
    app_state: web::Data<Arc<AppState>>,
    request: web::Json<CreateEquipmentRequest>,
) -> ApiResult<HttpResponse> {
    request.validate()?;
    crate::error::validate_quantity(request.total_quantity)?;

    let lab: Option<(String,)> = sqlx::query_as("SELECT id FROM laboratories WHERE id = ?")
        .bind(&request.lab_id)
        .fetch_optional(&app_state.db_pool)
        .await?;
    if lab.is_none() {
        return Err(ApiError::laboratory_not_found(&request.lab_id));
    }

    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let status = request
        .status
        .clone()
        .unwrap_or_else(|| "available".to_string());

    // New equipment starts with the full quantity available.
    sqlx::query(
        r#"
        INSERT INTO equipment (id, lab_id, name, status, total_quantity, available_quantity, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&request.lab_id)
    .bind(&request.name)
    .bind(&status)
    .bind(request.total_quantity)
    .bind(request.total_quantity)
    .bind(&now)
    .bind(&now)
    .execute(&app_state.db_pool)
    .await?;

    let created: Equipment = sqlx::query_as(&format!("{} WHERE e.id = ?", EQUIPMENT_SELECT))
        .bind(&id)
        .fetch_one(&app_state.db_pool)
        .await?;

    info!("🔬 Created equipment: {} x{} ({})", created.name, created.total_quantity, id);
    Ok(HttpResponse::Created().json(ApiResponse::success(created)))
}

// ==================== UPDATE EQUIPMENT ====================

pub async fn update_equipment(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    request: web::Json<UpdateEquipmentRequest>,
) -> ApiResult<HttpResponse> {
    request.validate()?;
    let equipment_id = path.into_inner();

    let mut tx = app_state.db_pool.begin().await?;

    let existing: Option<Equipment> =
        sqlx::query_as(&format!("{} WHERE e.id = ?", EQUIPMENT_SELECT))
            .bind(&equipment_id)
            .fetch_optional(&mut *tx)
            .await?;
    let existing = existing.ok_or_else(|| ApiError::equipment_not_found(&equipment_id))?;

    let lab_id = request.lab_id.clone().unwrap_or_else(|| existing.lab_id.clone());
    let lab: Option<(String,)> = sqlx::query_as("SELECT id FROM laboratories WHERE id = ?")
        .bind(&lab_id)
        .fetch_optional(&mut *tx)
        .await?;
    if lab.is_none() {
        return Err(ApiError::laboratory_not_found(&lab_id));
    }
    let name = request.name.clone().unwrap_or(existing.name);
    let status = request.status.clone().unwrap_or(existing.status);
    let total_quantity = request.total_quantity.unwrap_or(existing.total_quantity);
    crate::error::validate_quantity(total_quantity)?;

    // Outstanding units stay reserved; shrinking the total below them is refused.
    let outstanding = existing.total_quantity - existing.available_quantity;
    let available_quantity = total_quantity - outstanding;
    if available_quantity < 0 {
        return Err(ApiError::bad_request(&format!(
            "Cannot reduce total below {} units currently reserved",
            outstanding
        )));
    }

    sqlx::query(
        r#"
        UPDATE equipment
        SET lab_id = ?, name = ?, status = ?, total_quantity = ?, available_quantity = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&lab_id)
    .bind(&name)
    .bind(&status)
    .bind(total_quantity)
    .bind(available_quantity)
    .bind(Utc::now())
    .bind(&equipment_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    let updated: Equipment = sqlx::query_as(&format!("{} WHERE e.id = ?", EQUIPMENT_SELECT))
        .bind(&equipment_id)
        .fetch_one(&app_state.db_pool)
        .await?;

    info!("🔬 Updated equipment: {} ({})", updated.name, equipment_id);
    Ok(HttpResponse::Ok().json(ApiResponse::success(updated)))
}

// ==================== DELETE EQUIPMENT ====================

pub async fn delete_equipment(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> ApiResult<HttpResponse> {
    let equipment_id = path.into_inner();

    let active: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM reservations WHERE equipment_id = ? AND status IN ('pending', 'approved')",
    )
    .bind(&equipment_id)
    .fetch_one(&app_state.db_pool)
    .await?;

    if active.0 > 0 {
        return Err(ApiError::bad_request(&format!(
            "Cannot delete equipment: {} active reservations reference it",
            active.0
        )));
    }

    let result = sqlx::query("DELETE FROM equipment WHERE id = ?")
        .bind(&equipment_id)
        .execute(&app_state.db_pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::equipment_not_found(&equipment_id));
    }

    info!("🔬 Deleted equipment: {}", equipment_id);
    Ok(HttpResponse::Ok().json(ApiResponse::success_with_message(
        (),
        "Equipment deleted successfully".to_string(),
    )))
}
