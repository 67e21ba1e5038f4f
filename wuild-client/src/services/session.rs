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

use std::sync::Mutex;
use std::time::Instant;
use wuild_common::model::{SessionId, SessionInfo, TaskExecutionInfo};

struct SessionState {
    info: SessionInfo,
    started: bool,
    start: Instant,
    last_finish: Instant,
}

/// Aggregates per-task results into the session summary. The lock is held
/// only while updating; snapshots are returned for sending so no lock sits
/// across a transport call.
pub struct SessionAccountant {
    state: Mutex<SessionState>,
}

impl Default for SessionAccountant {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionAccountant {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(SessionState {
                info: SessionInfo::default(),
                started: false,
                start: now,
                last_finish: now,
            }),
        }
    }

    pub fn start_session(&self, session_id: SessionId, client_id: &str) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        state.info = SessionInfo::new(session_id, client_id);
        state.started = true;
        state.start = now;
        state.last_finish = now;
    }

    /// Folds one finished task into the summary and returns the incremental
    /// snapshot to transmit.
    pub fn update(&self, execution: &TaskExecutionInfo, used_threads: u16) -> SessionInfo {
        let mut state = self.state.lock().unwrap();
        state.last_finish = Instant::now();
        state.info.tasks_count += 1;
        if !execution.result {
            state.info.failures_count += 1;
        }
        state.info.total_network_time += execution.network_request_time;
        state.info.total_execution_time += execution.tool_execution_time;
        state.info.current_used_threads = used_threads;
        state.info.max_used_threads = state.info.max_used_threads.max(used_threads);
        state.info.clone()
    }

    /// Ends the session, once. Returns the final snapshot to transmit, or
    /// `None` when the session was never started or already finished.
    pub fn finish(&self) -> Option<SessionInfo> {
        let mut state = self.state.lock().unwrap();
        if !state.started {
            return None;
        }
        state.started = false;
        state.info.elapsed_time = state.last_finish.duration_since(state.start);
        Some(state.info.clone())
    }

    pub fn snapshot(&self) -> SessionInfo {
        self.state.lock().unwrap().info.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use test_r::test;

    #[test]
    fn accounting_tracks_counts_and_times() {
        let accountant = SessionAccountant::new();
        accountant.start_session(SessionId(9), "builder");

        let ok = TaskExecutionInfo {
            result: true,
            stdout: String::new(),
            tool_execution_time: Duration::from_millis(5),
            network_request_time: Duration::from_millis(2),
        };
        let failed = TaskExecutionInfo::failed("boom");

        accountant.update(&ok, 3);
        let snapshot = accountant.update(&failed, 1);

        assert_eq!(snapshot.tasks_count, 2);
        assert_eq!(snapshot.failures_count, 1);
        assert_eq!(snapshot.total_execution_time, Duration::from_millis(5));
        assert_eq!(snapshot.total_network_time, Duration::from_millis(2));
        assert_eq!(snapshot.current_used_threads, 1);
        assert_eq!(snapshot.max_used_threads, 3);
    }

    #[test]
    fn finish_is_idempotent() {
        let accountant = SessionAccountant::new();
        assert!(accountant.finish().is_none());

        accountant.start_session(SessionId(1), "builder");
        assert!(accountant.finish().is_some());
        assert!(accountant.finish().is_none());
    }
}
