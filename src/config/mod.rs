use crate::{Result, FabricError};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub registry: RegistryConfig,
    pub gate: GateConfig,
    pub cost_guard: CostGuardConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub min_agents: usize,
    pub max_agents: usize,
    pub scale_up_threshold: usize,
    pub scale_down_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub approval_timeout_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostGuardConfig {
    pub cache_ttl_secs: u64,
    /// Endpoint for the external-inference collaborator; when unset the
    /// guard serves a deterministic simulated response instead.
    pub external_inference_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub data_dir: String,
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenv() {
            Ok(path) => tracing::info!("Loaded .env file from: {:?}", path),
            Err(_) => tracing::debug!("No .env file found, using process environment"),
        }

        let min_agents = env_parsed("MIN_AGENTS", 4usize);
        let max_agents = env_parsed("MAX_AGENTS", 200usize);

        if min_agents == 0 {
            return Err(FabricError::ConfigurationError(
                "MIN_AGENTS must be at least 1".to_string(),
            ));
        }
        if min_agents > max_agents {
            return Err(FabricError::ConfigurationError(format!(
                "MIN_AGENTS ({min_agents}) cannot exceed MAX_AGENTS ({max_agents})"
            )));
        }

        let approval_timeout_hours = env_parsed(
            "APPROVAL_TIMEOUT_HOURS",
            crate::constants::DEFAULT_APPROVAL_TIMEOUT_HOURS,
        );
        if approval_timeout_hours <= 0 {
            return Err(FabricError::ConfigurationError(
                "APPROVAL_TIMEOUT_HOURS must be positive".to_string(),
            ));
        }

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let external_inference_url = env::var("EXTERNAL_INFERENCE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Ok(Config {
            api: ApiConfig {
                host: env::var("FABRIC_API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                // FABRIC_API_PORT wins; plain PORT is honored for container
                // platforms that inject it.
                port: env_parsed("FABRIC_API_PORT", env_parsed("PORT", 5010u16)),
                allowed_origins,
            },
            registry: RegistryConfig {
                min_agents,
                max_agents,
                scale_up_threshold: env_parsed(
                    "SCALE_UP_THRESHOLD",
                    crate::constants::SCALE_UP_THRESHOLD,
                ),
                scale_down_threshold: env_parsed(
                    "SCALE_DOWN_THRESHOLD",
                    crate::constants::SCALE_DOWN_THRESHOLD,
                ),
            },
            gate: GateConfig {
                approval_timeout_hours,
            },
            cost_guard: CostGuardConfig {
                cache_ttl_secs: env_parsed(
                    "CACHE_TTL_SECONDS",
                    crate::constants::DEFAULT_CACHE_TTL_SECS,
                ),
                external_inference_url,
            },
            store: StoreConfig {
                data_dir: env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 5010,
                allowed_origins: vec!["http://localhost:3000".to_string()],
            },
            registry: RegistryConfig {
                min_agents: 4,
                max_agents: 200,
                scale_up_threshold: crate::constants::SCALE_UP_THRESHOLD,
                scale_down_threshold: crate::constants::SCALE_DOWN_THRESHOLD,
            },
            gate: GateConfig {
                approval_timeout_hours: crate::constants::DEFAULT_APPROVAL_TIMEOUT_HOURS,
            },
            cost_guard: CostGuardConfig {
                cache_ttl_secs: crate::constants::DEFAULT_CACHE_TTL_SECS,
                external_inference_url: None,
            },
            store: StoreConfig {
                data_dir: "data".to_string(),
            },
        }
    }
}
