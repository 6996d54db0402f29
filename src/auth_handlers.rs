// src/auth_handlers.rs
//! Login, registration and user administration handlers

use actix_web::{web, HttpResponse};
use chrono::Duration;
use log::{info, warn};
use std::sync::Arc;
use validator::Validate;

use crate::auth::{
    validate_password_strength, Claims, LoginRequest, LoginResponse, RegisterRequest, User,
    UserInfo, UserRole,
};
use crate::error::{ApiError, ApiResult};
use crate::handlers::ApiResponse;
use crate::AppState;

// ==================== LOGIN ====================

pub async fn login(
    app_state: web::Data<Arc<AppState>>,
    request: web::Json<LoginRequest>,
) -> ApiResult<HttpResponse> {
    request.validate()?;

    let mut user = User::find_by_email(&app_state.db_pool, &request.email)
        .await
        .map_err(|_| ApiError::AuthError("Invalid email or password".to_string()))?;

    if !user.is_active {
        return Err(ApiError::AuthError("This account has been deactivated".to_string()));
    }

    if user.is_locked() {
        warn!("🔒 Login attempt on locked account: {}", user.email);
        return Err(ApiError::AuthError(
            "Account temporarily locked. Try again later".to_string(),
        ));
    }

    let auth = &app_state.auth_service;
    if !auth.verify_password(&request.password, &user.password_hash)? {
        user.increment_failed_attempts(&app_state.db_pool).await?;
        if user.failed_login_attempts >= app_state.config.auth.max_login_attempts {
            let lockout = Duration::minutes(app_state.config.auth.lockout_duration_minutes);
            user.lock_for_duration(&app_state.db_pool, lockout).await?;
            warn!("🔒 Account locked after repeated failures: {}", user.email);
        }
        return Err(ApiError::AuthError("Invalid email or password".to_string()));
    }

    user.reset_failed_attempts(&app_state.db_pool).await?;
    user.update_last_login(&app_state.db_pool).await?;

    let token = auth.generate_token(&user)?;
    info!("🔑 User logged in: {} ({})", user.email, user.get_role().display_name());

    Ok(HttpResponse::Ok().json(ApiResponse::success(LoginResponse {
        token,
        expires_in: auth.token_expiration_seconds(),
        user: UserInfo::from(user),
    })))
}

// ==================== REGISTER ====================

pub async fn register(
    app_state: web::Data<Arc<AppState>>,
    request: web::Json<RegisterRequest>,
) -> ApiResult<HttpResponse> {
    request.validate()?;
    validate_password_strength(&request.password)?;

    // Self-registration always creates a student. The very first account
    // becomes the admin so a fresh install is usable.
    let (user_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
        .fetch_one(&app_state.db_pool)
        .await?;
    let role = if user_count == 0 {
        UserRole::Admin
    } else {
        UserRole::Student
    };

    let user = User::create(
        &app_state.db_pool,
        &request.name,
        &request.email,
        &request.password,
        role,
        &app_state.auth_service,
    )
    .await?;

    info!("👤 Registered user: {} as {}", user.email, role.display_name());

    let token = app_state.auth_service.generate_token(&user)?;
    Ok(HttpResponse::Created().json(ApiResponse::success(LoginResponse {
        token,
        expires_in: app_state.auth_service.token_expiration_seconds(),
        user: UserInfo::from(user),
    })))
}

// ==================== PROFILE / LOGOUT ====================

pub async fn get_profile(
    app_state: web::Data<Arc<AppState>>,
    claims: Claims,
) -> ApiResult<HttpResponse> {
    let user = User::find_by_id(&app_state.db_pool, &claims.sub).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(UserInfo::from(user))))
}

/// Tokens are stateless, so logout is a client-side discard. The endpoint
/// exists so the client has something to call and we get an audit line.
pub async fn logout(claims: Claims) -> ApiResult<HttpResponse> {
    info!("🔑 User logged out: {}", claims.email);
    Ok(HttpResponse::Ok().json(ApiResponse::success_with_message(
        (),
        "Logged out successfully".to_string(),
    )))
}

// ==================== USER ADMINISTRATION ====================

pub async fn get_users(app_state: web::Data<Arc<AppState>>) -> ApiResult<HttpResponse> {
    let users: Vec<User> = sqlx::query_as("SELECT * FROM users ORDER BY name ASC")
        .fetch_all(&app_state.db_pool)
        .await?;
    let users: Vec<UserInfo> = users.into_iter().map(UserInfo::from).collect();
    Ok(HttpResponse::Ok().json(ApiResponse::success(users)))
}

pub async fn create_user(
    app_state: web::Data<Arc<AppState>>,
    request: web::Json<RegisterRequest>,
) -> ApiResult<HttpResponse> {
    request.validate()?;
    validate_password_strength(&request.password)?;

    let role = match request.role.as_deref() {
        Some(raw) => UserRole::from_str(raw)
            .ok_or_else(|| ApiError::bad_request(&format!("Unknown role: {}", raw)))?,
        None => UserRole::Student,
    };

    let user = User::create(
        &app_state.db_pool,
        &request.name,
        &request.email,
        &request.password,
        role,
        &app_state.auth_service,
    )
    .await?;

    info!("👤 Admin created user: {} as {}", user.email, role.display_name());
    Ok(HttpResponse::Created().json(ApiResponse::success(UserInfo::from(user))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn state(pool: sqlx::SqlitePool) -> web::Data<Arc<AppState>> {
        web::Data::new(Arc::new(AppState::for_tests(pool)))
    }

    #[actix_rt::test]
    async fn first_registration_becomes_admin_then_students() {
        let pool = test_pool().await;
        let state = state(pool.clone());

        register(
            state.clone(),
            web::Json(RegisterRequest {
                name: "Ada Lovelace".to_string(),
                email: "ada@example.edu".to_string(),
                password: "Sup3rSecret".to_string(),
                role: None,
            }),
        )
        .await
        .unwrap();

        register(
            state.clone(),
            web::Json(RegisterRequest {
                name: "Grace Hopper".to_string(),
                email: "grace@example.edu".to_string(),
                password: "Sup3rSecret".to_string(),
                role: Some("admin".to_string()),
            }),
        )
        .await
        .unwrap();

        let ada = User::find_by_email(&pool, "ada@example.edu").await.unwrap();
        let grace = User::find_by_email(&pool, "grace@example.edu").await.unwrap();
        assert_eq!(ada.get_role(), UserRole::Admin);
        // requested role is ignored on self-registration
        assert_eq!(grace.get_role(), UserRole::Student);
    }

    #[actix_rt::test]
    async fn repeated_bad_passwords_lock_the_account() {
        let pool = test_pool().await;
        let state = state(pool.clone());

        register(
            state.clone(),
            web::Json(RegisterRequest {
                name: "Ada Lovelace".to_string(),
                email: "ada@example.edu".to_string(),
                password: "Sup3rSecret".to_string(),
                role: None,
            }),
        )
        .await
        .unwrap();

        for _ in 0..state.config.auth.max_login_attempts {
            let attempt = login(
                state.clone(),
                web::Json(LoginRequest {
                    email: "ada@example.edu".to_string(),
                    password: "wrong-password".to_string(),
                }),
            )
            .await;
            assert!(attempt.is_err());
        }

        // even the correct password is refused while locked
        let locked = login(
            state.clone(),
            web::Json(LoginRequest {
                email: "ada@example.edu".to_string(),
                password: "Sup3rSecret".to_string(),
            }),
        )
        .await;
        assert!(locked.is_err());
    }

    #[actix_rt::test]
    async fn login_returns_token_and_profile() {
        let pool = test_pool().await;
        let state = state(pool.clone());

        register(
            state.clone(),
            web::Json(RegisterRequest {
                name: "Ada Lovelace".to_string(),
                email: "ada@example.edu".to_string(),
                password: "Sup3rSecret".to_string(),
                role: None,
            }),
        )
        .await
        .unwrap();

        let resp = login(
            state.clone(),
            web::Json(LoginRequest {
                email: "ada@example.edu".to_string(),
                password: "Sup3rSecret".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), actix_web::http::StatusCode::OK);
    }
}
