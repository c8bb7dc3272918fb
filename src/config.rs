use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub storage: StorageConfig,
    pub admin: AdminConfig,
    pub tracker: TrackerConfig,
    pub packaging: PackagingConfig,
    pub scripts: ScriptsConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub ssl_mode: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    pub catalog_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub bucket: String,
    pub public_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub username: String,
    /// bcrypt hash of the admin password
    pub password_hash: String,
    pub jwt_secret: String,
    pub token_ttl: Duration,
    pub issuer: String,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Pause between writing an audit row and re-counting the audit table.
    pub settle_delay: Duration,
    pub ip_hash_salt: String,
}

#[derive(Debug, Clone)]
pub struct PackagingConfig {
    pub pack_max_stickers: usize,
    pub pack_image_size: u32,
    pub pack_webp_quality: f32,
    pub individual_delay: Duration,
    pub job_retention: Duration,
}

#[derive(Debug, Clone)]
pub struct ScriptsConfig {
    pub dir: PathBuf,
    pub allowed: Vec<String>,
}

impl Config {
    pub fn load() -> Self {
        dotenvy::dotenv().ok();

        Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("SERVER_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(8080),
                environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
                max_upload_bytes: env::var("MAX_UPLOAD_BYTES")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(50 * 1024 * 1024),
            },
            database: DatabaseConfig {
                host: env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: env::var("DB_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(5432),
                user: env::var("DB_USER").unwrap_or_else(|_| "postgres".to_string()),
                password: env::var("DB_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
                database: env::var("DB_NAME").unwrap_or_else(|_| "sticker_gallery".to_string()),
                ssl_mode: env::var("DB_SSL_MODE").unwrap_or_else(|_| "disable".to_string()),
                max_connections: env::var("DB_MAX_CONNS")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(25),
            },
            redis: RedisConfig {
                host: env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: env::var("REDIS_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(6379),
                password: env::var("REDIS_PASSWORD").ok(),
                db: env::var("REDIS_DB")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(0),
                catalog_ttl: Duration::from_secs(
                    env::var("CATALOG_CACHE_TTL")
                        .ok()
                        .and_then(|p| p.parse().ok())
                        .unwrap_or(5 * 60), // 5 minutes
                ),
            },
            storage: StorageConfig {
                endpoint: env::var("STORAGE_ENDPOINT")
                    .unwrap_or_else(|_| "http://localhost:9000".to_string()),
                access_key: env::var("STORAGE_ACCESS_KEY")
                    .unwrap_or_else(|_| "minioadmin".to_string()),
                secret_key: env::var("STORAGE_SECRET_KEY")
                    .unwrap_or_else(|_| "minioadmin".to_string()),
                region: env::var("STORAGE_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
                bucket: env::var("STORAGE_BUCKET").unwrap_or_else(|_| "stickers".to_string()),
                public_url: env::var("STORAGE_PUBLIC_URL").ok(),
            },
            admin: AdminConfig {
                username: env::var("ADMIN_USERNAME").unwrap_or_else(|_| "admin".to_string()),
                password_hash: env::var("ADMIN_PASSWORD_HASH").unwrap_or_default(),
                jwt_secret: env::var("JWT_SECRET").unwrap_or_default(),
                token_ttl: Duration::from_secs(
                    env::var("JWT_TTL")
                        .ok()
                        .and_then(|p| p.parse().ok())
                        .unwrap_or(12 * 60 * 60), // 12 hours
                ),
                issuer: env::var("JWT_ISSUER").unwrap_or_else(|_| "sticker-gallery".to_string()),
            },
            tracker: TrackerConfig {
                settle_delay: Duration::from_millis(
                    env::var("TRACKER_SETTLE_DELAY_MS")
                        .ok()
                        .and_then(|p| p.parse().ok())
                        .unwrap_or(500),
                ),
                ip_hash_salt: env::var("IP_HASH_SALT").unwrap_or_default(),
            },
            packaging: PackagingConfig {
                pack_max_stickers: env::var("PACK_MAX_STICKERS")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(30),
                pack_image_size: env::var("PACK_IMAGE_SIZE")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(512),
                pack_webp_quality: env::var("PACK_WEBP_QUALITY")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(80.0),
                individual_delay: Duration::from_millis(
                    env::var("INDIVIDUAL_DOWNLOAD_DELAY_MS")
                        .ok()
                        .and_then(|p| p.parse().ok())
                        .unwrap_or(300),
                ),
                job_retention: Duration::from_secs(
                    env::var("JOB_RETENTION")
                        .ok()
                        .and_then(|p| p.parse().ok())
                        .unwrap_or(15 * 60), // 15 minutes
                ),
            },
            scripts: ScriptsConfig {
                dir: env::var("SCRIPTS_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./scripts")),
                allowed: env::var("ALLOWED_SCRIPTS")
                    .map(|s| parse_list(&s))
                    .unwrap_or_else(|_| {
                        vec![
                            "process-stickers".to_string(),
                            "generate-thumbnails".to_string(),
                            "sync-packs".to_string(),
                        ]
                    }),
            },
        }
    }

    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.database.user,
            self.database.password,
            self.database.host,
            self.database.port,
            self.database.database,
            self.database.ssl_mode
        )
    }

    pub fn redis_url(&self) -> String {
        match &self.redis.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.redis.host, self.redis.port, self.redis.db
            ),
            None => format!(
                "redis://{}:{}/{}",
                self.redis.host, self.redis.port, self.redis.db
            ),
        }
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_skips_blank_entries() {
        assert_eq!(
            parse_list(" sync-packs, ,generate-thumbnails,"),
            vec!["sync-packs".to_string(), "generate-thumbnails".to_string()]
        );
    }
}
