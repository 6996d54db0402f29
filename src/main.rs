use actix_web::{
    middleware::{Compress, DefaultHeaders, Logger},
    web, App, HttpRequest, HttpResponse, HttpServer,
};
use actix_cors::Cors;
use actix_web::http::header;
use actix_web_httpauth::middleware::HttpAuthentication;
use sqlx::{migrate::MigrateDatabase, sqlite::SqliteConnectOptions, Sqlite, SqlitePool};
use std::env;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod auth;
mod auth_handlers;
mod config;
mod db;
mod equipment_handlers;
mod error;
mod handlers;
mod lab_handlers;
mod models;
mod notification_handlers;
mod reservation_handlers;

use auth::{get_current_user, jwt_middleware, AuthService, UserRole};
use config::{load_config, Config};
use error::{ApiError, ApiResult};
use handlers::{get_dashboard_stats, ListQuery};
use models::{
    CreateEquipmentRequest, CreateLaboratoryRequest, CreateReservationRequest,
    UpdateEquipmentRequest, UpdateLaboratoryRequest, UpdateReservationStatusRequest,
};

pub struct AppState {
    pub db_pool: SqlitePool,
    pub config: Config,
    pub auth_service: Arc<AuthService>,
}

impl AppState {
    #[cfg(test)]
    pub fn for_tests(db_pool: SqlitePool) -> Self {
        let config = Config::default();
        let auth_service = Arc::new(AuthService::new(
            &config.auth.jwt_secret,
            config.auth.token_expiration_hours,
        ));
        Self {
            db_pool,
            config,
            auth_service,
        }
    }
}

// ==================== LABORATORY PROTECTED WRAPPERS ====================

async fn get_laboratories_protected(
    app_state: web::Data<Arc<AppState>>,
    query: web::Query<ListQuery>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    auth::check_permission(&claims, UserRole::can_view_inventory)?;
    lab_handlers::get_laboratories(app_state, query).await
}

async fn create_laboratory_protected(
    app_state: web::Data<Arc<AppState>>,
    request: web::Json<CreateLaboratoryRequest>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    auth::check_permission(&claims, UserRole::can_manage_inventory)?;
    lab_handlers::create_laboratory(app_state, request).await
}

async fn update_laboratory_protected(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    request: web::Json<UpdateLaboratoryRequest>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    auth::check_permission(&claims, UserRole::can_manage_inventory)?;
    lab_handlers::update_laboratory(app_state, path, request).await
}

async fn delete_laboratory_protected(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    auth::check_permission(&claims, UserRole::can_manage_inventory)?;
    lab_handlers::delete_laboratory(app_state, path).await
}

// ==================== EQUIPMENT PROTECTED WRAPPERS ====================

async fn get_equipment_protected(
    app_state: web::Data<Arc<AppState>>,
    query: web::Query<ListQuery>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    auth::check_permission(&claims, UserRole::can_view_inventory)?;
    equipment_handlers::get_equipment(app_state, query).await
}

async fn get_equipment_by_id_protected(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    auth::check_permission(&claims, UserRole::can_view_inventory)?;
    equipment_handlers::get_equipment_by_id(app_state, path).await
}

async fn create_equipment_protected(
    app_state: web::Data<Arc<AppState>>,
    request: web::Json<CreateEquipmentRequest>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    auth::check_permission(&claims, UserRole::can_manage_inventory)?;
    equipment_handlers::create_equipment(app_state, request).await
}

async fn update_equipment_protected(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    request: web::Json<UpdateEquipmentRequest>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    auth::check_permission(&claims, UserRole::can_manage_inventory)?;
    equipment_handlers::update_equipment(app_state, path, request).await
}

async fn delete_equipment_protected(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    auth::check_permission(&claims, UserRole::can_manage_inventory)?;
    equipment_handlers::delete_equipment(app_state, path).await
}

// ==================== RESERVATION PROTECTED WRAPPERS ====================

async fn get_reservations_protected(
    app_state: web::Data<Arc<AppState>>,
    query: web::Query<ListQuery>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    auth::check_permission(&claims, UserRole::can_view_all_reservations)?;
    reservation_handlers::get_reservations(app_state, query).await
}

async fn get_user_reservations_protected(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    query: web::Query<ListQuery>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    // Students may only read their own reservations.
    if claims.sub != *path && !claims.role.can_view_all_reservations() {
        return Err(ApiError::Forbidden(
            "Cannot view another user's reservations".to_string(),
        ));
    }
    reservation_handlers::get_user_reservations(app_state, path, query).await
}

async fn create_reservation_protected(
    app_state: web::Data<Arc<AppState>>,
    request: web::Json<CreateReservationRequest>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    auth::check_permission(&claims, UserRole::can_reserve_equipment)?;
    reservation_handlers::create_reservation(app_state, claims.sub, request).await
}

async fn update_reservation_status_protected(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    request: web::Json<UpdateReservationStatusRequest>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    auth::check_permission(&claims, UserRole::can_review_reservations)?;
    reservation_handlers::update_reservation_status(app_state, path, request).await
}

async fn complete_reservation_protected(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    auth::check_permission(&claims, UserRole::can_review_reservations)?;
    reservation_handlers::complete_reservation(app_state, path).await
}

async fn cancel_reservation_protected(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    reservation_handlers::cancel_reservation(app_state, claims.sub, path).await
}

async fn get_reservation_history_protected(
    app_state: web::Data<Arc<AppState>>,
    query: web::Query<ListQuery>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    auth::check_permission(&claims, UserRole::can_review_reservations)?;
    reservation_handlers::get_reservation_history(app_state, query).await
}

// ==================== USER / NOTIFICATION PROTECTED WRAPPERS ====================

async fn get_users_protected(
    app_state: web::Data<Arc<AppState>>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    auth::check_permission(&claims, UserRole::can_view_users)?;
    auth_handlers::get_users(app_state).await
}

async fn create_user_protected(
    app_state: web::Data<Arc<AppState>>,
    request: web::Json<auth::RegisterRequest>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    auth::check_permission(&claims, UserRole::can_manage_users)?;
    auth_handlers::create_user(app_state, request).await
}

async fn get_profile_protected(
    app_state: web::Data<Arc<AppState>>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    auth_handlers::get_profile(app_state, claims).await
}

async fn logout_protected(http_request: HttpRequest) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    auth_handlers::logout(claims).await
}

async fn get_user_notifications_protected(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    if claims.sub != *path && !claims.role.can_view_users() {
        return Err(ApiError::Forbidden(
            "Cannot view another user's notifications".to_string(),
        ));
    }
    notification_handlers::get_user_notifications(app_state, path).await
}

async fn mark_notification_read_protected(
    app_state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    let claims = get_current_user(&http_request)?;
    notification_handlers::mark_notification_read(app_state, claims, path).await
}

async fn get_dashboard_stats_protected(
    app_state: web::Data<Arc<AppState>>,
    http_request: HttpRequest,
) -> ApiResult<HttpResponse> {
    get_current_user(&http_request)?;
    get_dashboard_stats(app_state).await
}

// ==================== MAIN ====================

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;

    setup_logging(&config)?;

    if config.is_production() {
        validate_production_config(&config)?;
    }

    setup_database(&config.database.url).await?;
    let pool = create_database_pool(&config.database).await?;
    db::run_migrations(&pool).await?;

    let auth_service = Arc::new(AuthService::new(
        &config.auth.jwt_secret,
        config.auth.token_expiration_hours,
    ));

    create_default_admin_if_needed(&pool, &auth_service).await?;

    let app_state = Arc::new(AppState {
        db_pool: pool.clone(),
        config: config.clone(),
        auth_service: auth_service.clone(),
    });

    config.print_startup_info();
    let bind_address = format!("{}:{}", config.server.host, config.server.port);
    log::info!("🚀 Starting server at http://{}", bind_address);

    let workers = config.server.workers;
    let is_production = config.is_production();
    let server = HttpServer::new(move || {
        let cors = setup_cors(&config.security.allowed_origins, is_production);
        let auth_middleware = HttpAuthentication::bearer(jwt_middleware);
        let security_headers = setup_security_headers(&config.security);

        App::new()
            .wrap(cors)
            .wrap(security_headers)
            .wrap(Logger::default())
            .wrap(Compress::default())
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::Data::new(auth_service.clone()))
            // Health check (no auth)
            .route(
                "/health",
                web::get().to(|| async { HttpResponse::Ok().body("OK") }),
            )
            // Login and registration stay outside the bearer guard. They are
            // exact-match routes so the /api scope below never shadows them.
            .route("/api/auth/login", web::post().to(auth_handlers::login))
            .route("/api/auth/register", web::post().to(auth_handlers::register))
            // Protected API endpoints
            .service(
                web::scope("/api")
                    .wrap(auth_middleware)
                    .service(
                        web::scope("/auth")
                            .route("/profile", web::get().to(get_profile_protected))
                            .route("/logout", web::post().to(logout_protected)),
                    )
                    .service(
                        web::scope("/dashboard")
                            .route("/stats", web::get().to(get_dashboard_stats_protected)),
                    )
                    .service(
                        web::scope("/laboratories")
                            .route("", web::get().to(get_laboratories_protected))
                            .route("", web::post().to(create_laboratory_protected))
                            .route("/{id}", web::put().to(update_laboratory_protected))
                            .route("/{id}", web::delete().to(delete_laboratory_protected)),
                    )
                    .service(
                        web::scope("/equipment")
                            .route("", web::get().to(get_equipment_protected))
                            .route("", web::post().to(create_equipment_protected))
                            .route("/{id}", web::get().to(get_equipment_by_id_protected))
                            .route("/{id}", web::put().to(update_equipment_protected))
                            .route("/{id}", web::delete().to(delete_equipment_protected)),
                    )
                    .service(
                        web::scope("/reservations")
                            .route("", web::get().to(get_reservations_protected))
                            .route("", web::post().to(create_reservation_protected))
                            // registered before the {id} routes so "history" is
                            // never captured as an id
                            .route("/history", web::get().to(get_reservation_history_protected))
                            .route(
                                "/{id}/status",
                                web::put().to(update_reservation_status_protected),
                            )
                            .route(
                                "/{id}/complete",
                                web::put().to(complete_reservation_protected),
                            )
                            .route("/{id}/cancel", web::put().to(cancel_reservation_protected)),
                    )
                    .service(
                        web::scope("/users")
                            .route("", web::get().to(get_users_protected))
                            .route("", web::post().to(create_user_protected))
                            .route(
                                "/{id}/reservations",
                                web::get().to(get_user_reservations_protected),
                            ),
                    )
                    .service(
                        web::scope("/notifications")
                            .route(
                                "/{user_id}",
                                web::get().to(get_user_notifications_protected),
                            )
                            .route(
                                "/{id}/read",
                                web::put().to(mark_notification_read_protected),
                            ),
                    ),
            )
    });

    let server = match workers {
        Some(n) => server.workers(n),
        None => server,
    };
    server.bind(&bind_address)?.run().await?;

    Ok(())
}

// ==================== HELPER FUNCTIONS ====================

fn setup_cors(allowed_origins: &[String], is_production: bool) -> Cors {
    let mut cors = Cors::default()
        .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
        .allowed_headers(vec![
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
        ])
        .max_age(3600);

    if allowed_origins.contains(&"*".to_string()) {
        if is_production {
            panic!("Wildcard CORS origin (*) is not allowed in production");
        }
        log::warn!("⚠️ Using wildcard CORS (*) in development mode");
        cors = cors.allow_any_origin();
    } else {
        for origin in allowed_origins {
            if !origin.is_empty() {
                cors = cors.allowed_origin(origin);
            }
        }
    }

    cors
}

fn setup_logging(config: &Config) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.as_str()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn validate_production_config(config: &Config) -> anyhow::Result<()> {
    if config.auth.jwt_secret.len() < 32 {
        anyhow::bail!("Insecure JWT secret in production! Must be at least 32 characters.");
    }
    if config.security.allowed_origins.contains(&"*".to_string()) {
        anyhow::bail!("Wildcard CORS origins not allowed in production!");
    }
    Ok(())
}

async fn setup_database(database_url: &str) -> anyhow::Result<()> {
    if !Sqlite::database_exists(database_url).await.unwrap_or(false) {
        log::info!("Creating database: {}", database_url);
        Sqlite::create_database(database_url).await?;
    }
    Ok(())
}

async fn create_database_pool(
    db_config: &crate::config::DatabaseConfig,
) -> anyhow::Result<SqlitePool> {
    let filename = db_config
        .url
        .strip_prefix("sqlite:")
        .unwrap_or(&db_config.url);
    let options = SqliteConnectOptions::new()
        .filename(filename)
        .create_if_missing(true);

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(db_config.max_connections)
        .min_connections(db_config.min_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

fn setup_security_headers(config: &crate::config::SecurityConfig) -> DefaultHeaders {
    let mut headers = DefaultHeaders::new()
        .add(("X-Content-Type-Options", "nosniff"))
        .add(("X-Frame-Options", "DENY"))
        .add(("Referrer-Policy", "strict-origin-when-cross-origin"));

    if config.require_https {
        headers = headers.add((
            "Strict-Transport-Security",
            "max-age=31536000; includeSubDomains; preload",
        ));
    }

    headers
}

async fn create_default_admin_if_needed(
    pool: &SqlitePool,
    auth_service: &AuthService,
) -> anyhow::Result<()> {
    let user_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
        .fetch_one(pool)
        .await?;
    if user_count.0 > 0 {
        return Ok(());
    }

    let password = env::var("DEFAULT_ADMIN_PASSWORD").unwrap_or_else(|_| {
        let pwd = config::generate_jwt_secret();
        let pwd = format!("Aa1{}", &pwd[..13]);
        log::warn!("⚠️ Generated admin password: {}", pwd);
        pwd
    });

    auth::User::create(
        pool,
        "Administrator",
        "admin@labreserve.local",
        &password,
        UserRole::Admin,
        auth_service,
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to create default admin user: {}", e))?;

    log::info!("👤 Created default admin account: admin@labreserve.local");
    Ok(())
}
