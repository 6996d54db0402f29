use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use std::fmt;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unauthorized(String),
    Forbidden(String),
    InternalServerError(String),
    ValidationError(String),
    DatabaseError(sqlx::Error),
    AuthError(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    message: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ApiError::BadRequest(msg) => write!(f, "Bad Request: {}", msg),
            ApiError::NotFound(msg) => write!(f, "Not Found: {}", msg),
            ApiError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            ApiError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            ApiError::InternalServerError(msg) => write!(f, "Internal Server Error: {}", msg),
            ApiError::ValidationError(msg) => write!(f, "Validation Error: {}", msg),
            ApiError::DatabaseError(err) => write!(f, "Database Error: {}", err),
            ApiError::AuthError(msg) => write!(f, "Auth Error: {}", msg),
        }
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        let error_response = ErrorResponse {
            success: false,
            message: self.to_string(),
        };

        match self {
            ApiError::BadRequest(_) => HttpResponse::BadRequest().json(error_response),
            ApiError::NotFound(_) => HttpResponse::NotFound().json(error_response),
            ApiError::Unauthorized(_) => HttpResponse::Unauthorized().json(error_response),
            ApiError::Forbidden(_) => HttpResponse::Forbidden().json(error_response),
            ApiError::ValidationError(_) => HttpResponse::UnprocessableEntity().json(error_response),
            ApiError::DatabaseError(_) => HttpResponse::InternalServerError().json(error_response),
            ApiError::AuthError(_) => HttpResponse::Unauthorized().json(error_response),
            ApiError::InternalServerError(_) => HttpResponse::InternalServerError().json(error_response),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::DatabaseError(err)
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        ApiError::ValidationError(err.to_string())
    }
}

// Domain-specific constructors
impl ApiError {
    pub fn not_found(resource: &str) -> Self {
        ApiError::NotFound(format!("{} not found", resource))
    }

    pub fn bad_request(msg: &str) -> Self {
        ApiError::BadRequest(msg.to_string())
    }

    pub fn laboratory_not_found(id: &str) -> Self {
        ApiError::NotFound(format!("Laboratory with ID '{}' not found", id))
    }

    pub fn equipment_not_found(id: &str) -> Self {
        ApiError::NotFound(format!("Equipment with ID '{}' not found", id))
    }

    pub fn reservation_not_found(id: &str) -> Self {
        ApiError::NotFound(format!("Reservation with ID '{}' not found", id))
    }

    pub fn insufficient_quantity(available: i64, requested: i64) -> Self {
        ApiError::BadRequest(format!(
            "Insufficient quantity. Available: {}, Requested: {}",
            available, requested
        ))
    }

    pub fn invalid_transition(from: &str, to: &str) -> Self {
        ApiError::BadRequest(format!(
            "Cannot change reservation status from '{}' to '{}'",
            from, to
        ))
    }

    pub fn reservation_conflict() -> Self {
        ApiError::BadRequest(
            "Equipment is already reserved for the requested time range".to_string(),
        )
    }
}

// Validation helpers shared by the handlers
pub fn validate_quantity(quantity: i64) -> Result<(), ApiError> {
    if quantity < 1 {
        return Err(ApiError::ValidationError(
            "Quantity must be at least 1".to_string(),
        ));
    }
    if quantity > 10_000 {
        return Err(ApiError::ValidationError("Quantity too large".to_string()));
    }
    Ok(())
}

pub fn validate_time_range(
    start: chrono::DateTime<chrono::Utc>,
    end: chrono::DateTime<chrono::Utc>,
) -> Result<(), ApiError> {
    if end <= start {
        return Err(ApiError::ValidationError(
            "End time must be after start time".to_string(),
        ));
    }
    Ok(())
}
