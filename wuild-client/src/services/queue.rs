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

use crate::metrics;
use crate::model::TaskWrap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use wuild_common::model::ToolId;

/// FIFO of pending task wraps with an inline expiration scan. The lock is
/// held only during push/pop/scan; the size is mirrored into an atomic for
/// telemetry.
pub struct RequestQueue {
    items: Mutex<VecDeque<TaskWrap>>,
    pending: AtomicI32,
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            pending: AtomicI32::new(0),
        }
    }

    pub fn push(&self, task: TaskWrap) {
        let mut items = self.items.lock().unwrap();
        items.push_back(task);
        self.pending.store(items.len() as i32, Ordering::Relaxed);
        metrics::PENDING_TASKS.set(items.len() as i64);
    }

    pub fn front_tool_id(&self) -> Option<ToolId> {
        let items = self.items.lock().unwrap();
        items.front().map(|task| task.rewritten_invocation.tool_id.clone())
    }

    pub fn pop_front(&self) -> Option<TaskWrap> {
        let mut items = self.items.lock().unwrap();
        let task = items.pop_front();
        self.pending.store(items.len() as i32, Ordering::Relaxed);
        metrics::PENDING_TASKS.set(items.len() as i64);
        task
    }

    /// Removes and returns every task whose expiration moment has passed,
    /// preserving the order of the remainder.
    pub fn drain_expired(&self, now: Instant) -> Vec<TaskWrap> {
        let mut items = self.items.lock().unwrap();
        let mut expired = Vec::new();
        let mut remaining = VecDeque::with_capacity(items.len());
        while let Some(task) = items.pop_front() {
            if task.expiration_time <= now {
                expired.push(task);
            } else {
                remaining.push_back(task);
            }
        }
        *items = remaining;
        self.pending.store(items.len() as i32, Ordering::Relaxed);
        metrics::PENDING_TASKS.set(items.len() as i64);
        expired
    }

    pub fn pending(&self) -> i32 {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}
