// Copyright 2024-2025 Wuild Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use wuild_common::config::{ConfigExample, ConfigLoader, HasConfigExamples};
use wuild_common::model::{CompressionKind, RetryConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("client_id must not be empty")]
    EmptyClientId,
    #[error("invocation_attempts must be at least 1")]
    NoAttempts,
    #[error("queue_timeout must be non-zero")]
    ZeroQueueTimeout,
    #[error("request_timeout must be non-zero")]
    ZeroRequestTimeout,
    #[error("coordinator is enabled but has no host")]
    CoordinatorWithoutHost,
    #[error("coordinator is enabled but has no port")]
    CoordinatorWithoutPort,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorClientConfig {
    pub host: String,
    pub port: u16,
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub send_info_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub quant_interval: Duration,
}

impl Default for CoordinatorClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 7767,
            enabled: true,
            send_info_interval: Duration::from_secs(1),
            quant_interval: Duration::from_millis(100),
        }
    }
}

impl CoordinatorClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled {
            if self.host.is_empty() {
                return Err(ConfigError::CoordinatorWithoutHost);
            }
            if self.port == 0 {
                return Err(ConfigError::CoordinatorWithoutPort);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteToolClientConfig {
    pub client_id: String,
    pub coordinator: CoordinatorClientConfig,
    #[serde(with = "humantime_serde")]
    pub queue_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub invocation_attempts: u8,
    pub compression: CompressionKind,
    pub minimal_remote_tasks: i32,
    #[serde(with = "humantime_serde")]
    pub dispatch_quant: Duration,
    pub reconnect: RetryConfig,
}

impl Default for RemoteToolClientConfig {
    fn default() -> Self {
        Self {
            client_id: gethostname::gethostname()
                .to_string_lossy()
                .into_owned(),
            coordinator: CoordinatorClientConfig::default(),
            queue_timeout: Duration::from_secs(20),
            request_timeout: Duration::from_secs(240),
            invocation_attempts: 2,
            compression: CompressionKind::Gzip,
            minimal_remote_tasks: 1,
            dispatch_quant: Duration::from_millis(1),
            reconnect: RetryConfig::default(),
        }
    }
}

impl RemoteToolClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_id.is_empty() {
            return Err(ConfigError::EmptyClientId);
        }
        if self.invocation_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if self.queue_timeout.is_zero() {
            return Err(ConfigError::ZeroQueueTimeout);
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroRequestTimeout);
        }
        self.coordinator.validate()
    }
}

impl HasConfigExamples<RemoteToolClientConfig> for RemoteToolClientConfig {
    fn examples() -> Vec<ConfigExample<RemoteToolClientConfig>> {
        vec![(
            "coordinator-disabled",
            RemoteToolClientConfig {
                coordinator: CoordinatorClientConfig {
                    enabled: false,
                    ..CoordinatorClientConfig::default()
                },
                ..RemoteToolClientConfig::default()
            },
        )]
    }
}

pub fn make_remote_tool_client_config_loader() -> ConfigLoader<RemoteToolClientConfig> {
    ConfigLoader::new_with_examples(&PathBuf::from("config/remote-tool-client.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn default_config_is_valid() {
        assert!(RemoteToolClientConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let config = RemoteToolClientConfig {
            invocation_attempts: 0,
            ..RemoteToolClientConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NoAttempts)));
    }

    #[test]
    fn enabled_coordinator_needs_an_address() {
        let config = RemoteToolClientConfig {
            coordinator: CoordinatorClientConfig {
                host: String::new(),
                ..CoordinatorClientConfig::default()
            },
            ..RemoteToolClientConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CoordinatorWithoutHost)
        ));

        let config = RemoteToolClientConfig {
            coordinator: CoordinatorClientConfig {
                port: 0,
                enabled: false,
                ..CoordinatorClientConfig::default()
            },
            ..RemoteToolClientConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
