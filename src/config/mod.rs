use serde::Deserialize;

/// Complete alm-sync configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub alm: AlmConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sync: SyncDefaults,
}

/// Remote ALM server
#[derive(Debug, Clone, Deserialize)]
pub struct AlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Value sent as `client-type` when opening the site session
    #[serde(default = "default_client_type")]
    pub client_type: String,
}

fn default_base_url() -> String {
    "http://localhost:8080/qcbin".to_string()
}

fn default_client_type() -> String {
    "REST-Client".to_string()
}

impl Default for AlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            client_type: default_client_type(),
        }
    }
}

/// Certificate validation policy for the ALM connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrustPolicy {
    #[default]
    Strict,
    /// Self-signed on-premise servers. Logged loudly at startup.
    AcceptInvalidCerts,
}

/// HTTP transport settings
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_metadata_timeout")]
    pub metadata_timeout_secs: u64,
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub trust_policy: TrustPolicy,
}

fn default_metadata_timeout() -> u64 {
    30
}

fn default_download_timeout() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            metadata_timeout_secs: default_metadata_timeout(),
            download_timeout_secs: default_download_timeout(),
            max_attempts: default_max_attempts(),
            trust_policy: TrustPolicy::default(),
        }
    }
}

/// Local SQLite store
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String {
    "alm_sync.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncDefaults {
    /// Partition used when a caller does not name one
    #[serde(default = "default_group")]
    pub default_group: String,
}

fn default_group() -> String {
    "default".to_string()
}

impl Default for SyncDefaults {
    fn default() -> Self {
        Self {
            default_group: default_group(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> anyhow::Result<SyncConfig> {
    use anyhow::Context;

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: SyncConfig = toml::from_str(&contents).context("Failed to parse config file")?;
    Ok(config)
}
