// src/notification_handlers.rs
//! User notification handlers

use actix_web::{web, HttpResponse};
use chrono::Utc;
use log::warn;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::Claims;
use crate::error::{ApiError, ApiResult};
use crate::handlers::ApiResponse;
use crate::models::Notification;
use crate::AppState;

/// Insert a notification for a user. Failures are logged and swallowed:
/// a lost notification must never fail the reservation write that caused it.
pub async fn record(pool: &SqlitePool, user_id: &str, message: &str) {
    let result = sqlx::query(
        "INSERT INTO notifications (id, user_id, message, is_read, created_at) VALUES (?, ?, ?, 0, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(message)
    .bind(Utc::now())
    .execute(pool)
    .await;

    if let Err(e) = result {
        warn!("⚠️ Failed to record notification for {}: {}", user_id, e);
    }
}

// ==================== GET USER NOTIFICATIONS ====================

pub async fn get_user_notifications(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> ApiResult<HttpResponse> {
    let user_id = path.into_inner();
    let notifications: Vec<Notification> = sqlx::query_as(
        "SELECT id, user_id, message, is_read, created_at FROM notifications WHERE user_id = ? ORDER BY created_at DESC",
    )
    .bind(&user_id)
    .fetch_all(&app_state.db_pool)
    .await?;

    Ok(HttpResponse::Ok().json(ApiResponse::success(notifications)))
}

// ==================== MARK NOTIFICATION READ ====================

pub async fn mark_notification_read(
    app_state: web::Data<Arc<AppState>>,
    claims: Claims,
    path: web::Path<String>,
) -> ApiResult<HttpResponse> {
    let notification_id = path.into_inner();

    let owner: Option<(String,)> =
        sqlx::query_as("SELECT user_id FROM notifications WHERE id = ?")
            .bind(&notification_id)
            .fetch_optional(&app_state.db_pool)
            .await?;
    let (owner_id,) = owner.ok_or_else(|| ApiError::not_found("Notification"))?;

    if owner_id != claims.sub && !claims.role.can_view_users() {
        return Err(ApiError::Forbidden(
            "Cannot modify another user's notifications".to_string(),
        ));
    }

    sqlx::query("UPDATE notifications SET is_read = 1 WHERE id = ?")
        .bind(&notification_id)
        .execute(&app_state.db_pool)
        .await?;

    Ok(HttpResponse::Ok().json(ApiResponse::success(())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserRole;
    use crate::db::test_pool;

    fn claims_for(user_id: &str, role: UserRole) -> Claims {
        Claims {
            sub: user_id.to_string(),
            name: "Test User".to_string(),
            email: format!("{}@example.com", user_id),
            role,
            exp: (Utc::now() + chrono::Duration::hours(1)).timestamp(),
            iat: Utc::now().timestamp(),
        }
    }

    async fn seed_user(pool: &sqlx::SqlitePool, id: &str) {
        sqlx::query(
            "INSERT INTO users (id, name, email, password_hash, role, is_active, created_at, updated_at) \
             VALUES (?, ?, ?, 'x', 'student', 1, ?, ?)",
        )
        .bind(id)
        .bind(id)
        .bind(format!("{}@example.com", id))
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(pool)
        .await
        .unwrap();
    }

    #[actix_rt::test]
    async fn notifications_come_back_newest_first() {
        let pool = test_pool().await;
        sqlx::query(
            "INSERT INTO users (id, name, email, password_hash, role, is_active, created_at, updated_at) \
             VALUES ('u1', 'Ada', 'ada@example.com', 'x', 'student', 1, ?, ?)",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&pool)
        .await
        .unwrap();

        record(&pool, "u1", "first").await;
        record(&pool, "u1", "second").await;

        let rows: Vec<Notification> = sqlx::query_as(
            "SELECT id, user_id, message, is_read, created_at FROM notifications WHERE user_id = 'u1' ORDER BY created_at DESC",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|n| !n.is_read));
    }

    #[actix_rt::test]
    async fn mark_read_is_owner_or_admin_only() {
        let pool = test_pool().await;
        let state = web::Data::new(Arc::new(AppState::for_tests(pool.clone())));
        seed_user(&pool, "owner").await;
        seed_user(&pool, "other").await;

        record(&pool, "owner", "approved").await;
        let (notification_id,): (String,) =
            sqlx::query_as("SELECT id FROM notifications WHERE user_id = 'owner'")
                .fetch_one(&pool)
                .await
                .unwrap();

        // another student cannot touch it
        let forbidden = mark_notification_read(
            state.clone(),
            claims_for("other", UserRole::Student),
            web::Path::from(notification_id.clone()),
        )
        .await;
        assert!(forbidden.is_err());
        let (is_read,): (bool,) =
            sqlx::query_as("SELECT is_read FROM notifications WHERE id = ?")
                .bind(&notification_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(!is_read);

        // the owner can
        mark_notification_read(
            state.clone(),
            claims_for("owner", UserRole::Student),
            web::Path::from(notification_id.clone()),
        )
        .await
        .unwrap();
        let (is_read,): (bool,) =
            sqlx::query_as("SELECT is_read FROM notifications WHERE id = ?")
                .bind(&notification_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(is_read);

        // and so can an admin for a notification they do not own
        record(&pool, "other", "rejected").await;
        let (other_id,): (String,) =
            sqlx::query_as("SELECT id FROM notifications WHERE user_id = 'other'")
                .fetch_one(&pool)
                .await
                .unwrap();
        mark_notification_read(
            state,
            claims_for("admin", UserRole::Admin),
            web::Path::from(other_id),
        )
        .await
        .unwrap();
    }
}
