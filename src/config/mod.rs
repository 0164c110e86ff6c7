use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub drive: DriveConfig,
    pub dispatcher: DispatcherConfig,
    pub launcher: LauncherConfig,
    pub credentials_encryption_key: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: String,
}

#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub backend: StorageBackend,
    pub server: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
    /// Swift only: Keystone application credential id/secret live in
    /// access_key/secret_key; this is the auth endpoint.
    pub auth_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    S3,
    Swift,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub tick: Duration,
    pub pre_roll: Duration,
    pub heartbeat_timeout: Duration,
    pub launch_retry_window: Duration,
    pub shard: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMethod {
    Process,
    Container,
}

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub method: LaunchMethod,
    pub orchestrator_url: String,
    pub orchestrator_token: String,
    pub namespace: String,
    pub worker_image: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

impl AppConfig {
    pub fn from_env() -> Self {
        let backend = match env_or("STORAGE_BACKEND", "s3").as_str() {
            "swift" => StorageBackend::Swift,
            _ => StorageBackend::S3,
        };
        let method = match env_or("LAUNCH_METHOD", "process").as_str() {
            "container" => LaunchMethod::Container,
            _ => LaunchMethod::Process,
        };
        Self {
            server: ServerConfig {
                host: env_or("SERVER_HOST", "0.0.0.0"),
                port: env_or("SERVER_PORT", "8080").parse().unwrap_or(8080),
            },
            database: DatabaseConfig {
                url: env_or(
                    "DATABASE_URL",
                    "postgres://meetserver:@localhost:5432/meetserver",
                ),
            },
            cache: CacheConfig {
                redis_url: env_or("REDIS_URL", "redis://127.0.0.1/"),
            },
            drive: DriveConfig {
                backend,
                server: env_or("DRIVE_SERVER", "http://localhost:9000"),
                access_key: env_or("DRIVE_ACCESSKEY", "minioadmin"),
                secret_key: env_or("DRIVE_SECRET", "minioadmin"),
                bucket: env_or("DRIVE_BUCKET", "meetserver-recordings"),
                region: env_or("DRIVE_REGION", "us-east-1"),
                auth_url: env_or("DRIVE_AUTH_URL", ""),
            },
            dispatcher: DispatcherConfig {
                tick: env_secs("DISPATCHER_TICK_SECONDS", 5),
                pre_roll: env_secs("DISPATCHER_PRE_ROLL_SECONDS", 60),
                heartbeat_timeout: env_secs("HEARTBEAT_TIMEOUT_SECONDS", 120),
                launch_retry_window: env_secs("LAUNCH_RETRY_WINDOW_SECONDS", 600),
                shard: std::env::var("DISPATCHER_SHARD")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            },
            launcher: LauncherConfig {
                method,
                orchestrator_url: env_or("ORCHESTRATOR_URL", ""),
                orchestrator_token: env_or("ORCHESTRATOR_TOKEN", ""),
                namespace: env_or("ORCHESTRATOR_NAMESPACE", "meetserver"),
                worker_image: env_or("WORKER_IMAGE", "meetserver:latest"),
            },
            credentials_encryption_key: env_or("CREDENTIALS_ENCRYPTION_KEY", ""),
        }
    }
}
