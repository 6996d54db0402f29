// src/lab_handlers.rs
//! Laboratory management handlers

use actix_web::{web, HttpResponse};
use chrono::Utc;
use log::info;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::error::{ApiError, ApiResult};
use crate::handlers::{search_matches, ApiResponse, ListQuery};
use crate::models::{CreateLaboratoryRequest, Laboratory, UpdateLaboratoryRequest};
use crate::AppState;

const LABORATORY_SELECT: &str = r#"
    SELECT l.id, l.name, l.created_at, l.updated_at, COUNT(e.id) AS equipment_count
    FROM laboratories l
    LEFT JOIN equipment e ON e.lab_id = l.id
"#;

// ==================== PURE VIEW HELPERS ====================

pub fn filter_laboratories(laboratories: Vec<Laboratory>, query: &ListQuery) -> Vec<Laboratory> {
    let mut filtered = laboratories;
    if let Some(term) = query.search_term() {
        filtered.retain(|lab| search_matches(term, &[&lab.name]));
    }
    filtered
}

pub fn sort_laboratories(laboratories: &mut [Laboratory], query: &ListQuery) {
    match query.sort_by.as_deref() {
        Some("equipment_count") => {
            laboratories.sort_by(|a, b| a.equipment_count.cmp(&b.equipment_count))
        }
        Some("created_at") => laboratories.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        _ => laboratories.sort_by(|a, b| a.name.cmp(&b.name)),
    }
    if query.descending() {
        laboratories.reverse();
    }
}

// ==================== GET ALL LABORATORIES ====================

pub async fn get_laboratories(
    app_state: web::Data<Arc<AppState>>,
    query: web::Query<ListQuery>,
) -> ApiResult<HttpResponse> {
    let laboratories: Vec<Laboratory> =
        sqlx::query_as(&format!("{} GROUP BY l.id ORDER BY l.name ASC", LABORATORY_SELECT))
            .fetch_all(&app_state.db_pool)
            .await?;

    let mut laboratories = filter_laboratories(laboratories, &query);
    sort_laboratories(&mut laboratories, &query);

    Ok(HttpResponse::Ok().json(ApiResponse::success(laboratories)))
}

// ==================== CREATE LABORATORY ====================

pub async fn create_laboratory(
    app_state: web::Data<Arc<AppState>>,
    request: web::Json<CreateLaboratoryRequest>,
) -> ApiResult<HttpResponse> {
    request.validate()?;

    let existing: Option<(String,)> =
        sqlx::query_as("SELECT id FROM laboratories WHERE LOWER(name) = LOWER(?)")
            .bind(&request.name)
            .fetch_optional(&app_state.db_pool)
            .await?;

    if existing.is_some() {
        return Err(ApiError::bad_request(
            "Laboratory with this name already exists",
        ));
    }

    let id = Uuid::new_v4().to_string();
    let now = Utc::now();

    sqlx::query("INSERT INTO laboratories (id, name, created_at, updated_at) VALUES (?, ?, ?, ?)")
        .bind(&id)
        .bind(&request.name)
        .bind(&now)
        .bind(&now)
        .execute(&app_state.db_pool)
        .await?;

    let created: Laboratory =
        sqlx::query_as(&format!("{} WHERE l.id = ? GROUP BY l.id", LABORATORY_SELECT))
            .bind(&id)
            .fetch_one(&app_state.db_pool)
            .await?;

    info!("🏛 Created laboratory: {} ({})", created.name, id);
    Ok(HttpResponse::Created().json(ApiResponse::success(created)))
}

// ==================== UPDATE LABORATORY ====================

pub async fn update_laboratory(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    request: web::Json<UpdateLaboratoryRequest>,
) -> ApiResult<HttpResponse> {
    request.validate()?;
    let lab_id = path.into_inner();

    let existing: Option<(String,)> = sqlx::query_as("SELECT name FROM laboratories WHERE id = ?")
        .bind(&lab_id)
        .fetch_optional(&app_state.db_pool)
        .await?;
    let existing_name = existing.ok_or_else(|| ApiError::laboratory_not_found(&lab_id))?.0;

    if request.name.to_lowercase() != existing_name.to_lowercase() {
        let duplicate: Option<(String,)> =
            sqlx::query_as("SELECT id FROM laboratories WHERE LOWER(name) = LOWER(?) AND id != ?")
                .bind(&request.name)
                .bind(&lab_id)
                .fetch_optional(&app_state.db_pool)
                .await?;
        if duplicate.is_some() {
            return Err(ApiError::bad_request(
                "Laboratory with this name already exists",
            ));
        }
    }

    sqlx::query("UPDATE laboratories SET name = ?, updated_at = ? WHERE id = ?")
        .bind(&request.name)
        .bind(Utc::now())
        .bind(&lab_id)
        .execute(&app_state.db_pool)
        .await?;

    let updated: Laboratory =
        sqlx::query_as(&format!("{} WHERE l.id = ? GROUP BY l.id", LABORATORY_SELECT))
            .bind(&lab_id)
            .fetch_one(&app_state.db_pool)
            .await?;

    info!("🏛 Updated laboratory: {} ({})", updated.name, lab_id);
    Ok(HttpResponse::Ok().json(ApiResponse::success(updated)))
}

// ==================== DELETE LABORATORY ====================

pub async fn delete_laboratory(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> ApiResult<HttpResponse> {
    let lab_id = path.into_inner();

    let equipment_count: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM equipment WHERE lab_id = ?")
            .bind(&lab_id)
            .fetch_one(&app_state.db_pool)
            .await?;

    if equipment_count.0 > 0 {
        return Err(ApiError::bad_request(&format!(
            "Cannot delete laboratory: {} equipment items are assigned to it",
            equipment_count.0
        )));
    }

    let result = sqlx::query("DELETE FROM laboratories WHERE id = ?")
        .bind(&lab_id)
        .execute(&app_state.db_pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::laboratory_not_found(&lab_id));
    }

    info!("🏛 Deleted laboratory: {}", lab_id);
    Ok(HttpResponse::Ok().json(ApiResponse::success_with_message(
        (),
        "Laboratory deleted successfully".to_string(),
    )))
}
