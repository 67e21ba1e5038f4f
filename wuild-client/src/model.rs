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

use std::time::{Duration, Instant};
use wuild_common::model::{TaskExecutionInfo, TaskId, ToolInvocation};
use wuild_common::protocol::ToolRequestFrame;

/// Invoked exactly once per submitted task, from a transport task; callers
/// must not block it unreasonably.
pub type InvokeCallback = Box<dyn FnOnce(TaskExecutionInfo) + Send + 'static>;

/// One queued or in-flight request. Owned by the request queue while queued,
/// then by the dispatch loop until the reply routes it out.
pub struct TaskWrap {
    pub task_id: TaskId,
    pub original_invocation: ToolInvocation,
    pub rewritten_invocation: ToolInvocation,
    pub request: ToolRequestFrame,
    pub callback: InvokeCallback,
    pub start: Instant,
    pub enqueue_time: Instant,
    pub expiration_time: Instant,
    pub per_request_timeout: Duration,
    pub attempts_remain: u8,
}

impl std::fmt::Debug for TaskWrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskWrap")
            .field("task_id", &self.task_id)
            .field("tool_id", &self.rewritten_invocation.tool_id)
            .field("attempts_remain", &self.attempts_remain)
            .finish()
    }
}
