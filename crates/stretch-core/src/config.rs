//! stretch.toml configuration parser.
//!
//! The file is read first; selected environment variables then override
//! individual values so secrets can be kept out of the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StretchConfig {
    pub pipelines: PipelinesConfig,
    pub pool: PoolConfig,
    pub azure: AzureConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// Azure Pipelines connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelinesConfig {
    /// Organization URL, e.g. `https://dev.azure.com/contoso`.
    pub url: String,
    /// Numeric agent pool id used by the REST API.
    pub pool_id: u32,
    /// Pool name passed to the agent install script.
    pub pool_name: String,
    /// Personal access token.
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_size: u32,
    pub vm_prefix: String,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_provisioning_timeout")]
    pub provisioning_timeout: String,
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureConfig {
    pub tenant_id: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    pub subscription_id: String,
    pub resource_group: String,
    pub region: String,
    /// Full resource id of the virtual network agents join.
    pub vnet_id: String,
    pub subnet_name: String,
    pub boot_diagnostics_uri: Option<String>,
    /// Resource id of the custom Linux image.
    pub custom_image: String,
    pub vm_size: String,
    pub admin_username: String,
    #[serde(default)]
    pub admin_password: String,
    /// URI of the agent install script fetched by the CustomScript extension.
    pub agent_install_script: String,
    /// Command prefix; the CI url, token, pool name and agent name are appended.
    pub agent_install_command: String,
    #[serde(default = "default_arm_endpoint")]
    pub arm_endpoint: String,
    #[serde(default = "default_login_endpoint")]
    pub login_endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/stretch/registry.redb"),
        }
    }
}

fn default_interval() -> String {
    "60s".to_string()
}

fn default_provisioning_timeout() -> String {
    "30m".to_string()
}

fn default_lease_ttl() -> String {
    "5m".to_string()
}

fn default_arm_endpoint() -> String {
    "https://management.azure.com".to_string()
}

fn default_login_endpoint() -> String {
    "https://login.microsoftonline.com".to_string()
}

impl StretchConfig {
    /// Load the config file, apply environment overrides and validate.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StretchConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Override values from a key lookup (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string_overrides: [(&str, &mut String); 10] = [
            ("DEVOPS_URL", &mut self.pipelines.url),
            ("DEVOPS_PAT", &mut self.pipelines.token),
            ("POOL_NAME", &mut self.pipelines.pool_name),
            ("VM_PREFIX", &mut self.pool.vm_prefix),
            ("CLIENT_ID", &mut self.azure.client_id),
            ("CLIENT_SECRET", &mut self.azure.client_secret),
            ("TENANT_ID", &mut self.azure.tenant_id),
            ("SUBSCRIPTION_ID", &mut self.azure.subscription_id),
            ("RESOURCE_GROUP", &mut self.azure.resource_group),
            ("ADMIN_PASSWORD", &mut self.azure.admin_password),
        ];
        for (key, slot) in string_overrides {
            if let Some(value) = lookup(key) {
                *slot = value;
            }
        }

        if let Some(value) = lookup("POOL_ID") {
            self.pipelines.pool_id = value
                .parse()
                .map_err(|_| ConfigError::Invalid { key: "POOL_ID", value })?;
        }
        if let Some(value) = lookup("POOL_MIN_SIZE") {
            self.pool.min_size = value
                .parse()
                .map_err(|_| ConfigError::Invalid { key: "POOL_MIN_SIZE", value })?;
        }
        Ok(())
    }

    /// Reject empty required settings and unparseable durations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("pipelines.url", &self.pipelines.url),
            ("pipelines.token", &self.pipelines.token),
            ("pipelines.pool_name", &self.pipelines.pool_name),
            ("pool.vm_prefix", &self.pool.vm_prefix),
            ("azure.tenant_id", &self.azure.tenant_id),
            ("azure.client_id", &self.azure.client_id),
            ("azure.client_secret", &self.azure.client_secret),
            ("azure.subscription_id", &self.azure.subscription_id),
            ("azure.resource_group", &self.azure.resource_group),
            ("azure.region", &self.azure.region),
            ("azure.vnet_id", &self.azure.vnet_id),
            ("azure.subnet_name", &self.azure.subnet_name),
            ("azure.custom_image", &self.azure.custom_image),
            ("azure.vm_size", &self.azure.vm_size),
            ("azure.admin_username", &self.azure.admin_username),
            ("azure.admin_password", &self.azure.admin_password),
            ("azure.agent_install_script", &self.azure.agent_install_script),
            ("azure.agent_install_command", &self.azure.agent_install_command),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(key));
            }
        }

        let durations = [
            ("pool.interval", &self.pool.interval),
            ("pool.provisioning_timeout", &self.pool.provisioning_timeout),
            ("pool.lease_ttl", &self.pool.lease_ttl),
        ];
        for (key, value) in durations {
            if parse_duration(value).is_none() {
                return Err(ConfigError::Invalid {
                    key,
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }
}

impl PoolConfig {
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(60))
    }

    pub fn provisioning_timeout(&self) -> Duration {
        parse_duration(&self.provisioning_timeout).unwrap_or(Duration::from_secs(30 * 60))
    }

    pub fn lease_ttl(&self) -> Duration {
        parse_duration(&self.lease_ttl).unwrap_or(Duration::from_secs(5 * 60))
    }
}

/// Parse a duration string like "5s", "500ms", "2m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
