use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

/// Where a generated signing secret is persisted across restarts.
const JWT_SECRET_FILE: &str = "data/jwt.secret";

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Origin used when composing share URLs.
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    #[serde(default = "default_jwt_secret")]
    pub secret: String,
    /// Duration string: `7d`, `12h`, `30m`, or plain seconds.
    #[serde(default = "default_jwt_expires_in")]
    pub expires_in: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_upload_path")]
    pub upload_path: String,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_max_batch_files")]
    pub max_batch_files: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_rate_limit_max_requests")]
    pub max_requests: u32,
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_frontend_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_db_path() -> String {
    "data/strongbox.db".to_string()
}

fn default_jwt_secret() -> String {
    String::new()
}

fn default_jwt_expires_in() -> String {
    "7d".to_string()
}

fn default_upload_path() -> String {
    "./uploads".to_string()
}

fn default_max_file_size() -> u64 {
    150 * 1024 * 1024
}

fn default_max_batch_files() -> usize {
    10
}

fn default_rate_limit_window_ms() -> u64 {
    15 * 60 * 1000
}

fn default_rate_limit_max_requests() -> u32 {
    100
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            frontend_url: default_frontend_url(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: default_jwt_secret(),
            expires_in: default_jwt_expires_in(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_path: default_upload_path(),
            max_file_size: default_max_file_size(),
            max_batch_files: default_max_batch_files(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_rate_limit_window_ms(),
            max_requests: default_rate_limit_max_requests(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            jwt: JwtConfig::default(),
            storage: StorageConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_env_overrides();
        config.ensure_directories()?;
        config.ensure_jwt_secret()?;
        Ok(config)
    }

    /// Token lifetime in seconds, parsed from the `expires_in` string.
    pub fn jwt_expires_in_seconds(&self) -> i64 {
        parse_duration_seconds(&self.jwt.expires_in).unwrap_or(7 * 24 * 3600)
    }

    /// Load configuration from config.toml
    fn load_from_file() -> anyhow::Result<Self> {
        let config_paths = ["config.toml", "data/config.toml"];

        for path in config_paths {
            if Path::new(path).exists() {
                let content = fs::read_to_string(path)?;
                let config: Config = toml::from_str(&content)?;
                tracing::info!("Read configuration from {}", path);
                return Ok(config);
            }
        }

        tracing::info!("No config file present; falling back to defaults");
        Ok(Config::default())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("HOST") {
            self.server.host = val;
        }
        if let Ok(val) = env::var("PORT") {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }
        if let Ok(val) = env::var("FRONTEND_URL") {
            if !val.trim().is_empty() {
                self.server.frontend_url = val;
            }
        }
        if let Ok(val) = env::var("DATABASE_PATH") {
            self.database.path = val;
        }
        if let Ok(val) = env::var("JWT_SECRET") {
            self.jwt.secret = val;
        }
        if let Ok(val) = env::var("JWT_EXPIRES_IN") {
            self.jwt.expires_in = val;
        }
        if let Ok(val) = env::var("UPLOAD_PATH") {
            self.storage.upload_path = val;
        }
        if let Ok(val) = env::var("MAX_FILE_SIZE") {
            if let Ok(size) = val.parse() {
                self.storage.max_file_size = size;
            }
        }
        if let Ok(val) = env::var("RATE_LIMIT_WINDOW_MS") {
            if let Ok(ms) = val.parse() {
                self.rate_limit.window_ms = ms;
            }
        }
        if let Ok(val) = env::var("RATE_LIMIT_MAX_REQUESTS") {
            if let Ok(max) = val.parse() {
                self.rate_limit.max_requests = max;
            }
        }
    }

    /// Resolve the token-signing secret.
    ///
    /// An explicit `JWT_SECRET` wins. Otherwise the secret minted on a
    /// previous boot is reused so tokens survive restarts; only a first
    /// boot generates one (32 random bytes, hex) and writes it down.
    fn ensure_jwt_secret(&mut self) -> anyhow::Result<()> {
        if !self.jwt.secret.is_empty() {
            return Ok(());
        }

        let secret_file = Path::new(JWT_SECRET_FILE);

        if let Ok(stored) = fs::read_to_string(secret_file) {
            let stored = stored.trim();
            if !stored.is_empty() {
                self.jwt.secret = stored.to_string();
                tracing::info!("Reusing signing secret from {}", JWT_SECRET_FILE);
                return Ok(());
            }
        }

        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        let secret = hex::encode(raw);

        if let Some(dir) = secret_file.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(secret_file, &secret)?;
        self.jwt.secret = secret;
        tracing::info!("No signing secret configured; minted one at {}", JWT_SECRET_FILE);
        Ok(())
    }

    /// Ensure required directories exist
    fn ensure_directories(&self) -> anyhow::Result<()> {
        if let Some(parent) = Path::new(&self.database.path).parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(&self.storage.upload_path)?;
        Ok(())
    }
}

/// Parse `7d` / `12h` / `30m` / `45s` / `3600` into seconds.
fn parse_duration_seconds(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (value, unit) = match s.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&s[..s.len() - 1], Some(c.to_ascii_lowercase())),
        _ => (s, None),
    };
    let n: i64 = value.parse().ok()?;
    let secs = match unit {
        Some('d') => n * 86_400,
        Some('h') => n * 3_600,
        Some('m') => n * 60,
        Some('s') | None => n,
        _ => return None,
    };
    (secs > 0).then_some(secs)
}
