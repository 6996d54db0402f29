// src/config.rs - Configuration management
use anyhow::{Context, Result};
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_expiration_hours: i64,
    pub max_login_attempts: i64,
    pub lockout_duration_minutes: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub require_https: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            // Fresh random secret per process unless JWT_SECRET overrides it.
            jwt_secret: generate_jwt_secret(),
            token_expiration_hours: 24,
            max_login_attempts: 5,
            lockout_duration_minutes: 15,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            workers: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:labreserve.db".to_string(),
            max_connections: 10,
            min_connections: 1,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
            require_https: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            auth: AuthConfig::default(),
            security: SecurityConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub fn generate_jwt_secret() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect()
}

pub fn load_config() -> Result<Config> {
    load_env_file()?;

    let mut config = if let Ok(config_file) = env::var("CONFIG_FILE") {
        let config_str = fs::read_to_string(&config_file)
            .with_context(|| format!("Failed to read config file: {}", config_file))?;
        toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", config_file))?
    } else {
        Config::default()
    };

    override_with_env(&mut config);

    config
        .validate()
        .context("Configuration validation failed")?;

    Ok(config)
}

fn override_with_env(config: &mut Config) {
    if let Ok(host) = env::var("BIND_ADDRESS") {
        config.server.host = host;
    }
    if let Ok(port_str) = env::var("RESERVE_PORT") {
        if let Ok(port) = port_str.parse::<u16>() {
            config.server.port = port;
        }
    }
    if let Ok(workers_str) = env::var("RESERVE_WORKERS") {
        if let Ok(workers) = workers_str.parse::<usize>() {
            config.server.workers = Some(workers);
        }
    }
    if let Ok(jwt_secret) = env::var("JWT_SECRET") {
        config.auth.jwt_secret = jwt_secret;
    }
    if let Ok(expiration_str) = env::var("AUTH_TOKEN_EXPIRATION_HOURS") {
        if let Ok(expiration) = expiration_str.parse::<i64>() {
            config.auth.token_expiration_hours = expiration;
        }
    }
    if let Ok(max_str) = env::var("AUTH_MAX_LOGIN_ATTEMPTS") {
        if let Ok(max) = max_str.parse::<i64>() {
            config.auth.max_login_attempts = max;
        }
    }
    if let Ok(lockout_str) = env::var("AUTH_LOCKOUT_DURATION_MINUTES") {
        if let Ok(lockout) = lockout_str.parse::<i64>() {
            config.auth.lockout_duration_minutes = lockout;
        }
    }
    if let Ok(url) = env::var("DATABASE_URL") {
        config.database.url = url;
    }
    if let Ok(max_conn_str) = env::var("DATABASE_MAX_CONNECTIONS") {
        if let Ok(max_conn) = max_conn_str.parse::<u32>() {
            config.database.max_connections = max_conn;
        }
    }
    if let Ok(origins_str) = env::var("ALLOWED_ORIGINS") {
        config.security.allowed_origins = origins_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Ok(level) = env::var("RUST_LOG") {
        config.logging.level = level;
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.len() < 32 {
            return Err(anyhow::anyhow!(
                "JWT_SECRET must be at least 32 characters long (current: {})",
                self.auth.jwt_secret.len()
            ));
        }

        if self.database.max_connections < self.database.min_connections {
            return Err(anyhow::anyhow!(
                "max_connections ({}) must be >= min_connections ({})",
                self.database.max_connections,
                self.database.min_connections
            ));
        }

        if self.auth.token_expiration_hours < 1 {
            return Err(anyhow::anyhow!("token_expiration_hours must be at least 1"));
        }

        Ok(())
    }

    pub fn is_production(&self) -> bool {
        env::var("RESERVE_ENV")
            .map(|v| v == "production")
            .unwrap_or(false)
    }

    pub fn print_startup_info(&self) {
        log::info!("🔬 Laboratory reservation service starting up...");
        log::info!("🌐 Server: {}:{}", self.server.host, self.server.port);
        log::info!(
            "💾 Database: {}",
            if self.database.url.contains("sqlite") {
                "SQLite"
            } else {
                "Unknown"
            }
        );
        log::info!(
            "🔒 Auth: JWT ({}h expiration)",
            self.auth.token_expiration_hours
        );
        log::info!("📊 Logging: {} level", self.logging.level);

        if !self.is_production() {
            log::warn!("🚧 Running in development mode");
        }
    }
}

pub fn load_env_file() -> Result<()> {
    if let Ok(env_file) = env::var("ENV_FILE") {
        dotenvy::from_filename(&env_file)
            .with_context(|| format!("Failed to load environment file: {}", env_file))?;
    } else if Path::new(".env").exists() {
        dotenvy::dotenv().context("Failed to load .env file")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.database.url, "sqlite:labreserve.db");
        assert!(config.auth.jwt_secret.len() >= 32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.auth.jwt_secret = "short".to_string();
        assert!(config.validate().is_err());

        config.auth.jwt_secret = "a".repeat(32);
        assert!(config.validate().is_ok());

        config.database.max_connections = 1;
        config.database.min_connections = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_content = r#"
        [server]
        host = "0.0.0.0"
        port = 9000
        [database]
        url = "sqlite:test.db"
        max_connections = 5
        min_connections = 1
        [auth]
        jwt_secret = "test_secret_123456789012345678901234567890"
        token_expiration_hours = 12
        max_login_attempts = 3
        lockout_duration_minutes = 10
        [security]
        allowed_origins = ["http://localhost:3000"]
        require_https = false
        [logging]
        level = "debug"
        "#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.auth.token_expiration_hours, 12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_generate_jwt_secret() {
        let secret = generate_jwt_secret();
        assert_eq!(secret.len(), 64);
        assert_ne!(secret, generate_jwt_secret());
    }
}
