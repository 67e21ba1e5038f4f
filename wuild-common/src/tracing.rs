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
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    pub service_name: String,
    pub default_directive: String,
    pub json: bool,
    pub with_time: bool,
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::local("wuild")
    }
}

impl TracingConfig {
    pub fn local(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            default_directive: "info".to_string(),
            json: false,
            with_time: true,
            with_ansi: true,
        }
    }

    pub fn test_pretty_without_time(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            default_directive: "debug".to_string(),
            json: false,
            with_time: false,
            with_ansi: true,
        }
    }

    /// `WUILD_LOG` overrides the default filter directive.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(directive) = std::env::var("WUILD_LOG") {
            self.default_directive = directive;
        }
        self
    }
}

fn make_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive))
}

fn init(config: &TracingConfig, default_directive: &str) {
    let result = match (config.json, config.with_time) {
        (true, _) => tracing_subscriber::fmt()
            .with_env_filter(make_filter(default_directive))
            .json()
            .try_init(),
        (false, true) => tracing_subscriber::fmt()
            .with_env_filter(make_filter(default_directive))
            .with_ansi(config.with_ansi)
            .try_init(),
        (false, false) => tracing_subscriber::fmt()
            .with_env_filter(make_filter(default_directive))
            .with_ansi(config.with_ansi)
            .without_time()
            .try_init(),
    };
    // Repeated init is expected from test fixtures sharing a process.
    if result.is_ok() {
        ::tracing::debug!("tracing initialized for {}", config.service_name);
    }
}

pub fn init_tracing_with_default_env_filter(config: &TracingConfig) {
    init(config, &config.default_directive);
}

pub fn init_tracing_with_default_debug_env_filter(config: &TracingConfig) {
    init(config, "debug");
}
