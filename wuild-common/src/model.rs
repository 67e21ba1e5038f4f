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

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Identifier of a tool a worker can execute, e.g. a compiler front-end.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode, Serialize, Deserialize,
)]
pub struct ToolId(String);

impl ToolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ToolId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ToolId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for ToolId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ToolId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Default for ToolId {
    fn default() -> Self {
        Self(String::new())
    }
}

/// Identifies the lifespan of one client facade. Minted from the wall clock
/// in microseconds at `start`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Encode,
    Decode,
    Serialize,
    Deserialize,
)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn from_current_time() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        Self(micros)
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic per-session task identifier. Never reused within a session; a
/// retried dispatch gets a fresh id.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize,
)]
pub struct TaskId(pub u64);

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-session occupancy reported by a worker in its status census.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct SessionCensus {
    pub session_id: SessionId,
    pub used_threads: u16,
}

/// Identity of a reachable worker. Immutable once observed; replaced
/// atomically on roster update.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct WorkerEndpoint {
    pub worker_id: String,
    pub host: String,
    pub port: u16,
    pub tool_ids: BTreeSet<ToolId>,
    pub total_threads: u16,
    pub version_tag: u32,
    pub connected_sessions: Vec<SessionCensus>,
}

impl WorkerEndpoint {
    pub fn has_tool(&self, tool_id: &ToolId) -> bool {
        self.tool_ids.contains(tool_id)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Display for WorkerEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.worker_id, self.host, self.port)
    }
}

/// Aggregated per-session statistics reported to the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub client_id: String,
    pub tasks_count: u32,
    pub failures_count: u32,
    pub total_network_time: Duration,
    pub total_execution_time: Duration,
    pub current_used_threads: u16,
    pub max_used_threads: u16,
    pub elapsed_time: Duration,
}

impl SessionInfo {
    pub fn new(session_id: SessionId, client_id: impl Into<String>) -> Self {
        Self {
            session_id,
            client_id: client_id.into(),
            ..Self::default()
        }
    }
}

/// Outcome of one tool task, delivered to the submitting caller exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskExecutionInfo {
    pub result: bool,
    pub stdout: String,
    pub tool_execution_time: Duration,
    pub network_request_time: Duration,
}

impl TaskExecutionInfo {
    pub fn failed(stdout: impl Into<String>) -> Self {
        Self {
            result: false,
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn profiling_str(&self) -> String {
        format!(
            "execution: {} us, network: {} us",
            self.tool_execution_time.as_micros(),
            self.network_request_time.as_micros()
        )
    }
}

/// A tool-id plus arguments and input/output file references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_id: ToolId,
    pub args: Vec<String>,
    pub input_file: Option<PathBuf>,
    pub output_file: Option<PathBuf>,
}

impl ToolInvocation {
    pub fn new(tool_id: impl Into<ToolId>) -> Self {
        Self {
            tool_id: tool_id.into(),
            args: Vec::new(),
            input_file: None,
            output_file: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_input(mut self, input: impl Into<PathBuf>) -> Self {
        self.input_file = Some(input.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output_file = Some(output.into());
        self
    }

    pub fn args_string(&self) -> String {
        self.args.join(" ")
    }
}

/// Codec applied to file payloads on the wire.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Encode, Decode, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionKind {
    None,
    #[default]
    Gzip,
}

/// Backoff schedule for transport reconnects. `max_attempts == 0` means
/// unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the given 1-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1).min(32) as i32);
        let delay = self.min_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt >= self.max_attempts
    }
}
