//! Typed snapshot of recognized environment variables.
//!
//! All keys share the `DRAGNET_` prefix. The snapshot is taken once via
//! [`EngineEnv::from_env`]; a malformed numeric or boolean value is a
//! fatal configuration error rather than a silently-applied default.

use std::path::PathBuf;

use super::ConfigError;

pub const ENV_LOCAL_STORAGE_DIR: &str = "DRAGNET_LOCAL_STORAGE_DIR";
pub const ENV_TOKEN: &str = "DRAGNET_TOKEN";
pub const ENV_API_BASE_URL: &str = "DRAGNET_API_BASE_URL";
pub const ENV_DEFAULT_KEY_VALUE_STORE_ID: &str = "DRAGNET_DEFAULT_KEY_VALUE_STORE_ID";
pub const ENV_DEFAULT_REQUEST_QUEUE_ID: &str = "DRAGNET_DEFAULT_REQUEST_QUEUE_ID";
pub const ENV_IS_AT_HOME: &str = "DRAGNET_IS_AT_HOME";
pub const ENV_HEADLESS: &str = "DRAGNET_HEADLESS";
pub const ENV_MEMORY_MBYTES: &str = "DRAGNET_MEMORY_MBYTES";

/// Recognized environment configuration, parsed once at startup.
#[derive(Debug, Clone)]
pub struct EngineEnv {
    /// Root directory for local file-backed queue / list / key-value store
    pub local_storage_dir: Option<PathBuf>,
    /// Authentication token for the remote storage backend
    pub token: Option<String>,
    /// Remote API base override
    pub api_base_url: Option<String>,
    /// Default key-value store identifier for persisted state
    pub default_key_value_store_id: String,
    /// Default request queue identifier
    pub default_request_queue_id: String,
    /// Running on the managed platform
    pub is_at_home: bool,
    /// Default headless mode for the browser backend
    pub headless: bool,
    /// Memory envelope for the snapshotter when cgroup limits are unavailable
    pub memory_mbytes: Option<u64>,
}

impl Default for EngineEnv {
    fn default() -> Self {
        Self {
            local_storage_dir: None,
            token: None,
            api_base_url: None,
            default_key_value_store_id: "default".to_string(),
            default_request_queue_id: "default".to_string(),
            is_at_home: false,
            headless: true,
            memory_mbytes: None,
        }
    }
}

impl EngineEnv {
    /// Read and validate the `DRAGNET_*` environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut env = Self::default();

        if let Ok(dir) = std::env::var(ENV_LOCAL_STORAGE_DIR)
            && !dir.is_empty()
        {
            env.local_storage_dir = Some(PathBuf::from(dir));
        }
        if let Ok(token) = std::env::var(ENV_TOKEN)
            && !token.is_empty()
        {
            env.token = Some(token);
        }
        if let Ok(base) = std::env::var(ENV_API_BASE_URL)
            && !base.is_empty()
        {
            env.api_base_url = Some(base.trim_end_matches('/').to_string());
        }
        if let Ok(id) = std::env::var(ENV_DEFAULT_KEY_VALUE_STORE_ID)
            && !id.is_empty()
        {
            env.default_key_value_store_id = id;
        }
        if let Ok(id) = std::env::var(ENV_DEFAULT_REQUEST_QUEUE_ID)
            && !id.is_empty()
        {
            env.default_request_queue_id = id;
        }
        if let Ok(raw) = std::env::var(ENV_IS_AT_HOME) {
            env.is_at_home = parse_bool(ENV_IS_AT_HOME, &raw)?;
        }
        if let Ok(raw) = std::env::var(ENV_HEADLESS) {
            env.headless = parse_bool(ENV_HEADLESS, &raw)?;
        }
        if let Ok(raw) = std::env::var(ENV_MEMORY_MBYTES) {
            let mbytes: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                key: ENV_MEMORY_MBYTES,
                value: raw.clone(),
                expected: "a positive integer (megabytes)",
            })?;
            if mbytes == 0 {
                return Err(ConfigError::InvalidEnv {
                    key: ENV_MEMORY_MBYTES,
                    value: raw,
                    expected: "a positive integer (megabytes)",
                });
            }
            env.memory_mbytes = Some(mbytes);
        }

        Ok(env)
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key,
            value: raw.to_string(),
            expected: "one of 1/0/true/false/yes/no",
        }),
    }
}
