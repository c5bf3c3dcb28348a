use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub bus: BusConfig,
    pub auth: AuthConfig,
    pub limits: LimitsConfig,
    pub retry: RetryConfig,
    pub dispatch: DispatchConfig,
    pub sweeper: SweeperConfig,
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Seconds after a successful delivery during which a resend is refused.
    pub resend_cooldown_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub schema: Option<String>,
    pub iam_auth: bool,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    pub project: String,
    pub topic: String,
    pub subscription: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub issuer: String,
    pub jwks_url: String,
    pub audience: String,
    /// A caller must hold at least one of these roles.
    pub required_roles: Vec<String>,
    /// Role that may read and resend notifications it did not create.
    pub admin_role: String,
    pub jwks_cache_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    pub max_per_attachment_bytes: usize,
    pub max_total_attachment_bytes: usize,
    /// Total attachment bytes above this route the message to SMTP.
    pub smtp_threshold_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_seconds: u64,
    pub cap_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    pub lease_ttl_seconds: u64,
    pub send_timeout_seconds: u64,
    pub worker_concurrency: u32,
    pub shutdown_grace_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    pub interval_seconds: u64,
    /// PENDING rows untouched for longer than this are re-enqueued.
    pub orphan_threshold_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    pub gc_notify: GcNotifyConfig,
    pub smtp: SmtpConfig,
    pub housing: HousingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GcNotifyConfig {
    pub base_url: String,
    pub api_key: String,
    pub email_template_id: Option<String>,
    pub sms_template_id: Option<String>,
    pub max_attachment_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HousingConfig {
    pub base_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_parse("PORT", 8080)?,
                resend_cooldown_seconds: env_parse("RESEND_COOLDOWN_SECONDS", 300)?,
            },
            database: DatabaseConfig {
                url: env::var("DB_URL").unwrap_or_else(|_| "sqlite://data/notify.db".to_string()),
                schema: env::var("DB_SCHEMA").ok(),
                iam_auth: env_bool("DB_IAM_AUTH", false),
                max_connections: env_parse("DB_MAX_CONNECTIONS", 5)?,
            },
            bus: BusConfig {
                project: env::var("BUS_PROJECT").unwrap_or_else(|_| "local".to_string()),
                topic: env::var("BUS_TOPIC").unwrap_or_else(|_| "notify-dispatch".to_string()),
                subscription: env::var("BUS_SUBSCRIPTION")
                    .unwrap_or_else(|_| "notify-dispatch-worker".to_string()),
            },
            auth: AuthConfig {
                issuer: env::var("AUTH_ISSUER")
                    .map_err(|_| ConfigError::MissingEnv("AUTH_ISSUER".to_string()))?,
                jwks_url: env::var("AUTH_JWKS_URL")
                    .map_err(|_| ConfigError::MissingEnv("AUTH_JWKS_URL".to_string()))?,
                audience: env::var("AUTH_AUDIENCE")
                    .map_err(|_| ConfigError::MissingEnv("AUTH_AUDIENCE".to_string()))?,
                required_roles: env::var("REQUIRED_ROLES")
                    .unwrap_or_else(|_| "notify-admin,notify-client".to_string())
                    .split(',')
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .collect(),
                admin_role: env::var("AUTH_ADMIN_ROLE")
                    .unwrap_or_else(|_| "notify-admin".to_string()),
                jwks_cache_ttl_seconds: env_parse("AUTH_JWKS_CACHE_TTL_SECONDS", 300)?,
            },
            limits: LimitsConfig {
                max_per_attachment_bytes: env_parse("MAX_PER_ATTACHMENT_BYTES", 6_291_456)?,
                max_total_attachment_bytes: env_parse("MAX_TOTAL_ATTACHMENT_BYTES", 20_971_520)?,
                smtp_threshold_bytes: env_parse("SMTP_THRESHOLD_BYTES", 6_291_456)?,
            },
            retry: RetryConfig {
                max_attempts: env_parse("RETRY_MAX_ATTEMPTS", 5)?,
                base_seconds: env_parse("RETRY_BASE_SECONDS", 5)?,
                cap_seconds: env_parse("RETRY_CAP_SECONDS", 600)?,
            },
            dispatch: DispatchConfig {
                lease_ttl_seconds: env_parse("LEASE_TTL_SECONDS", 300)?,
                send_timeout_seconds: env_parse("SEND_TIMEOUT_SECONDS", 30)?,
                worker_concurrency: env_parse("WORKER_CONCURRENCY", 4)?,
                shutdown_grace_seconds: env_parse("SHUTDOWN_GRACE_SECONDS", 30)?,
            },
            sweeper: SweeperConfig {
                interval_seconds: env_parse("SWEEP_INTERVAL_SECONDS", 60)?,
                orphan_threshold_seconds: env_parse("ORPHAN_THRESHOLD_SECONDS", 120)?,
            },
            providers: ProvidersConfig {
                gc_notify: GcNotifyConfig {
                    base_url: env::var("GC_NOTIFY_BASE_URL")
                        .unwrap_or_else(|_| "https://api.notification.canada.ca".to_string()),
                    api_key: env::var("GC_NOTIFY_API_KEY").unwrap_or_default(),
                    email_template_id: env::var("GC_NOTIFY_EMAIL_TEMPLATE_ID").ok(),
                    sms_template_id: env::var("GC_NOTIFY_SMS_TEMPLATE_ID").ok(),
                    max_attachment_bytes: env_parse("GC_NOTIFY_MAX_ATTACHMENT_BYTES", 2_097_152)?,
                },
                smtp: SmtpConfig {
                    host: env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
                    port: env_parse("SMTP_PORT", 25)?,
                    username: env::var("SMTP_USERNAME").ok(),
                    password: env::var("SMTP_PASSWORD").ok(),
                    from_address: env::var("SMTP_FROM_ADDRESS")
                        .unwrap_or_else(|_| "no-reply@notify.local".to_string()),
                },
                housing: HousingConfig {
                    base_url: env::var("HOUSING_BASE_URL").unwrap_or_default(),
                    token_url: env::var("HOUSING_TOKEN_URL").unwrap_or_default(),
                    client_id: env::var("HOUSING_CLIENT_ID").unwrap_or_default(),
                    client_secret: env::var("HOUSING_CLIENT_SECRET").unwrap_or_default(),
                },
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                resend_cooldown_seconds: 300,
            },
            database: DatabaseConfig {
                url: "sqlite::memory:".to_string(),
                schema: None,
                iam_auth: false,
                max_connections: 5,
            },
            bus: BusConfig {
                project: "local".to_string(),
                topic: "notify-dispatch".to_string(),
                subscription: "notify-dispatch-worker".to_string(),
            },
            auth: AuthConfig {
                issuer: "https://idp.test/realms/notify".to_string(),
                jwks_url: "https://idp.test/realms/notify/certs".to_string(),
                audience: "notify-api".to_string(),
                required_roles: vec!["notify-admin".to_string(), "notify-client".to_string()],
                admin_role: "notify-admin".to_string(),
                jwks_cache_ttl_seconds: 300,
            },
            limits: LimitsConfig {
                max_per_attachment_bytes: 6_291_456,
                max_total_attachment_bytes: 20_971_520,
                smtp_threshold_bytes: 6_291_456,
            },
            retry: RetryConfig {
                max_attempts: 5,
                base_seconds: 5,
                cap_seconds: 600,
            },
            dispatch: DispatchConfig {
                lease_ttl_seconds: 300,
                send_timeout_seconds: 30,
                worker_concurrency: 2,
                shutdown_grace_seconds: 30,
            },
            sweeper: SweeperConfig {
                interval_seconds: 60,
                orphan_threshold_seconds: 120,
            },
            providers: ProvidersConfig {
                gc_notify: GcNotifyConfig {
                    base_url: "https://api.notification.canada.ca".to_string(),
                    api_key: String::new(),
                    email_template_id: None,
                    sms_template_id: None,
                    max_attachment_bytes: 2_097_152,
                },
                smtp: SmtpConfig {
                    host: "localhost".to_string(),
                    port: 25,
                    username: None,
                    password: None,
                    from_address: "no-reply@notify.local".to_string(),
                },
                housing: HousingConfig {
                    base_url: String::new(),
                    token_url: String::new(),
                    client_id: String::new(),
                    client_secret: String::new(),
                },
            },
        }
    }
}
