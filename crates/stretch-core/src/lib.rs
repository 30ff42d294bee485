//! stretch-core — configuration for the Stretch build-agent pool manager.

pub mod config;

pub use config::{
    AzureConfig, ConfigError, PipelinesConfig, PoolConfig, RegistryConfig, StretchConfig,
    parse_duration,
};
