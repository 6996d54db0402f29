// src/handlers.rs - Shared response envelope, list query handling, dashboard
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiResult;
use crate::AppState;

// ==================== COMMON STRUCTURES ====================

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn success_with_message(data: T, message: String) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: Some(message),
        }
    }
}

/// Query parameters shared by the collection endpoints. Substring search is
/// case-insensitive; `status` and `laboratory` are exact-match filters;
/// sorting is by a single whitelisted field with an asc/desc toggle.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub search: Option<String>,
    pub status: Option<String>,
    pub laboratory: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

impl ListQuery {
    pub fn descending(&self) -> bool {
        self.sort_order
            .as_deref()
            .map(|o| o.eq_ignore_ascii_case("desc"))
            .unwrap_or(false)
    }

    pub fn search_term(&self) -> Option<&str> {
        self.search.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

/// True when any of the given fields contains `term` (case-insensitive).
pub fn search_matches(term: &str, fields: &[&str]) -> bool {
    let needle = term.to_lowercase();
    fields
        .iter()
        .any(|field| field.to_lowercase().contains(&needle))
}

// ==================== DASHBOARD STATISTICS ====================

#[derive(Debug, Serialize)]
pub struct DashboardStats {
    pub total_laboratories: i64,
    pub total_equipment: i64,
    pub pending_requests: i64,
    pub borrowed_items: i64,
}

pub async fn get_dashboard_stats(
    app_state: web::Data<Arc<AppState>>,
) -> ApiResult<HttpResponse> {
    let total_laboratories: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM laboratories")
        .fetch_one(&app_state.db_pool)
        .await?;

    let total_equipment: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM equipment")
        .fetch_one(&app_state.db_pool)
        .await?;

    let pending_requests: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM reservations WHERE status = 'pending'")
            .fetch_one(&app_state.db_pool)
            .await?;

    let borrowed_items: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM reservations WHERE status = 'approved'")
            .fetch_one(&app_state.db_pool)
            .await?;

    let stats = DashboardStats {
        total_laboratories: total_laboratories.0,
        total_equipment: total_equipment.0,
        pending_requests: pending_requests.0,
        borrowed_items: borrowed_items.0,
    };

    Ok(HttpResponse::Ok().json(ApiResponse::success(stats)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_is_case_insensitive_substring() {
        assert!(search_matches("osc", &["Oscilloscope", "Physics Lab"]));
        assert!(search_matches("PHYSICS", &["Oscilloscope", "Physics Lab"]));
        assert!(search_matches("cs l", &["Physics Lab"]));
        assert!(!search_matches("chem", &["Oscilloscope", "Physics Lab"]));
    }

    #[test]
    fn empty_search_term_is_ignored() {
        let query = ListQuery {
            search: Some("   ".to_string()),
            ..Default::default()
        };
        assert!(query.search_term().is_none());

        let query = ListQuery {
            search: Some(" osc ".to_string()),
            ..Default::default()
        };
        assert_eq!(query.search_term(), Some("osc"));
    }

    #[test]
    fn sort_order_toggle() {
        let mut query = ListQuery::default();
        assert!(!query.descending());

        query.sort_order = Some("desc".to_string());
        assert!(query.descending());

        query.sort_order = Some("DESC".to_string());
        assert!(query.descending());

        query.sort_order = Some("asc".to_string());
        assert!(!query.descending());
    }
}
