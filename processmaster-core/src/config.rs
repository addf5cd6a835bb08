use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessMasterConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
    /// `production` masks 5xx error details in responses.
    pub environment: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            environment: "development".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    20
}

fn default_acquire_timeout() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// Request body ceiling for JSON and multipart bodies.
    pub max_body_bytes: usize,
    /// Per-client-IP budget. 0 disables rate limiting.
    pub rate_limit_per_minute: u32,
    pub cors_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            max_body_bytes: 50 * 1024 * 1024,
            rate_limit_per_minute: 600,
            cors_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VisionConfig {
    pub base_url: String,
    pub model: String,
    /// Falls back to `ANTHROPIC_API_KEY` when empty.
    pub api_key: String,
    pub anthropic_version: String,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub timeout_secs: u64,
    /// Concurrent screenshot analyses per guide generation job.
    pub concurrency: usize,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-3-sonnet-20240229".to_string(),
            api_key: String::new(),
            anthropic_version: "2023-06-01".to_string(),
            max_retries: 3,
            retry_delay_ms: 500,
            timeout_secs: 60,
            concurrency: 4,
        }
    }
}

impl VisionConfig {
    pub fn resolved_api_key(&self) -> String {
        if !self.api_key.is_empty() {
            return self.api_key.clone();
        }
        std::env::var("ANTHROPIC_API_KEY").unwrap_or_default()
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Filesystem root of the local object store (`~` is expanded).
    pub root: String,
    pub bucket: String,
    /// Base URL that signed object URLs are issued against.
    pub public_base_url: String,
    pub signing_secret: String,
    pub max_upload_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: "~/.processmaster/objects".to_string(),
            bucket: "processmaster-files".to_string(),
            public_base_url: "http://127.0.0.1:3001".to_string(),
            signing_secret: "dev-signing-secret-change-me".to_string(),
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CaptureConfig {
    pub max_width: u32,
    pub max_height: u32,
    pub max_files_per_upload: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_width: 1920,
            max_height: 1080,
            max_files_per_upload: 20,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct JobsConfig {
    /// Worker tasks. 0 means one per CPU.
    pub workers: usize,
    pub queue_capacity: usize,
    pub stuck_after_secs: u64,
    pub recovery_interval_secs: u64,
    pub job_timeout_secs: u64,
    pub max_attempts: i32,
    pub max_batch_images: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_capacity: 256,
            stuck_after_secs: 900,
            recovery_interval_secs: 60,
            job_timeout_secs: 600,
            max_attempts: 3,
            max_batch_images: 50,
        }
    }
}

impl JobsConfig {
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
    /// Front-end origin used for share links and OAuth2 callback redirects.
    pub web_base_url: String,
    pub ldap: LdapConfig,
    pub oauth2: Option<OAuth2Config>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "dev-jwt-secret-change-me".to_string(),
            access_ttl_secs: 15 * 60,
            refresh_ttl_secs: 7 * 24 * 60 * 60,
            web_base_url: "http://localhost:3000".to_string(),
            ldap: LdapConfig::default(),
            oauth2: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LdapConfig {
    pub enabled: bool,
    /// Serve logins from a static in-memory directory instead of the network.
    pub mock: bool,
    pub url: String,
    pub bind_dn: String,
    pub bind_password: String,
    pub search_base: String,
    /// `{{username}}` is replaced with the escaped login name.
    pub search_filter: String,
    /// Checked in order against `memberOf`; first match wins.
    pub group_roles: Vec<GroupRole>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GroupRole {
    /// Case-insensitive substring of the group DN, e.g. `CN=ProcessMaster-Admins`.
    pub group: String,
    pub role: String,
}

impl Default for LdapConfig {
    fn default() -> Self {
        let group_roles = [
            ("CN=ProcessMaster-Admins", "admin"),
            ("CN=ProcessMaster-Users", "user"),
            ("CN=ProcessMaster-Viewers", "viewer"),
        ]
        .into_iter()
        .map(|(group, role)| GroupRole {
            group: group.to_string(),
            role: role.to_string(),
        })
        .collect();

        Self {
            enabled: false,
            mock: false,
            url: "ldap://localhost:389".to_string(),
            bind_dn: String::new(),
            bind_password: String::new(),
            search_base: "dc=example,dc=com".to_string(),
            search_filter: "(|(uid={{username}})(mail={{username}}))".to_string(),
            group_roles,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OAuth2Config {
    pub issuer_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    #[serde(default = "default_oauth2_scope")]
    pub scope: String,
}

fn default_oauth2_scope() -> String {
    "openid profile email".to_string()
}

impl ProcessMasterConfig {
    /// Load from a TOML file, then apply `PROCESSMASTER__SECTION__KEY` overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("PROCESSMASTER").separator("__"))
            .build()?;
        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_capture_bounds() {
        let c = CaptureConfig::default();
        assert_eq!((c.max_width, c.max_height), (1920, 1080));
    }

    #[test]
    fn test_worker_count_zero_uses_cpus() {
        let jobs = JobsConfig::default();
        assert!(jobs.worker_count() >= 1);

        let fixed = JobsConfig {
            workers: 3,
            ..JobsConfig::default()
        };
        assert_eq!(fixed.worker_count(), 3);
    }

    #[test]
    fn test_production_detection() {
        let mut s = ServiceConfig::default();
        assert!(!s.is_production());
        s.environment = "Production".to_string();
        assert!(s.is_production());
    }

    #[test]
    fn test_load_toml_with_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pm.toml");
        std::fs::write(
            &path,
            r#"
[database]
url = "postgresql://localhost/pm"

[jobs]
workers = 2
"#,
        )
        .unwrap();

        let cfg = ProcessMasterConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.database.max_connections, 20);
        assert_eq!(cfg.jobs.workers, 2);
        assert_eq!(cfg.jobs.queue_capacity, 256);
        assert_eq!(cfg.auth.access_ttl_secs, 900);
        assert!(cfg.auth.oauth2.is_none());
        assert_eq!(cfg.auth.ldap.group_roles.len(), 3);
    }
}
