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

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use tracing::debug;
use wuild_common::model::{SessionId, ToolId, WorkerEndpoint};

const TASK_WEIGHT_SCALE: i32 = 32768;

/// Outcome of feeding one roster entry into the balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientUpdate {
    Added(usize),
    Updated(usize),
    Skipped,
}

struct WorkerState {
    endpoint: WorkerEndpoint,
    active: bool,
    busy_mine: u16,
    busy_others: u16,
    each_task_weight: i32,
}

impl WorkerState {
    fn new(endpoint: WorkerEndpoint) -> Self {
        let each_task_weight = TASK_WEIGHT_SCALE / endpoint.total_threads.max(1) as i32;
        Self {
            endpoint,
            active: false,
            busy_mine: 0,
            busy_others: 0,
            each_task_weight,
        }
    }

    /// Splits the worker's census into own occupancy and everyone else's.
    fn refresh_busy(&mut self, my_session: SessionId) {
        let total = self.endpoint.total_threads;
        let mut mine: u16 = 0;
        let mut others: u16 = 0;
        for census in &self.endpoint.connected_sessions {
            if census.session_id == my_session {
                mine = mine.saturating_add(census.used_threads);
            } else {
                others = others.saturating_add(census.used_threads);
            }
        }
        self.busy_mine = mine.min(total);
        self.busy_others = others.min(total - self.busy_mine);
    }

    fn remaining(&self) -> u16 {
        self.endpoint
            .total_threads
            .saturating_sub(self.busy_mine)
            .saturating_sub(self.busy_others)
    }
}

struct BalancerTable {
    workers: Vec<WorkerState>,
    required_tool_ids: BTreeSet<ToolId>,
    session_id: SessionId,
}

/// Tracks known workers, their per-tool capacity and current load, and picks
/// the next worker for a task. The full table sits behind one mutex; the
/// aggregate counters are atomics readable from hot paths.
pub struct ToolBalancer {
    table: Mutex<BalancerTable>,
    free_remote_threads: AtomicU16,
    used_threads: AtomicU16,
}

impl Default for ToolBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolBalancer {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(BalancerTable {
                workers: Vec::new(),
                required_tool_ids: BTreeSet::new(),
                session_id: SessionId::default(),
            }),
            free_remote_threads: AtomicU16::new(0),
            used_threads: AtomicU16::new(0),
        }
    }

    pub fn set_required_tools(&self, tool_ids: impl IntoIterator<Item = ToolId>) {
        let mut table = self.table.lock().unwrap();
        table.required_tool_ids = tool_ids.into_iter().collect();
    }

    pub fn set_session_id(&self, session_id: SessionId) {
        let mut table = self.table.lock().unwrap();
        table.session_id = session_id;
    }

    /// Inserts or refreshes a worker. A worker advertising no threads or
    /// missing a required tool is skipped. Existing entries keep their
    /// connection state; the census and weight are recomputed either way.
    pub fn update_client(&self, endpoint: WorkerEndpoint) -> ClientUpdate {
        let mut table = self.table.lock().unwrap();
        if endpoint.total_threads == 0 {
            return ClientUpdate::Skipped;
        }
        if !table
            .required_tool_ids
            .iter()
            .all(|tool| endpoint.has_tool(tool))
        {
            debug!("skipping worker {endpoint}, missing required tools");
            return ClientUpdate::Skipped;
        }

        let session_id = table.session_id;
        let existing = table
            .workers
            .iter()
            .position(|state| state.endpoint.worker_id == endpoint.worker_id);
        let update = match existing {
            Some(index) => {
                let state = &mut table.workers[index];
                state.endpoint = endpoint;
                state.each_task_weight =
                    TASK_WEIGHT_SCALE / state.endpoint.total_threads as i32;
                state.refresh_busy(session_id);
                ClientUpdate::Updated(index)
            }
            None => {
                let mut state = WorkerState::new(endpoint);
                state.refresh_busy(session_id);
                table.workers.push(state);
                ClientUpdate::Added(table.workers.len() - 1)
            }
        };
        self.recalc_available(&table);
        update
    }

    pub fn set_client_active(&self, index: usize, active: bool) {
        let mut table = self.table.lock().unwrap();
        let Some(state) = table.workers.get_mut(index) else {
            return;
        };
        state.active = active;
        debug!(
            "worker {} is now {}",
            state.endpoint,
            if active { "active" } else { "inactive" }
        );
        self.recalc_available(&table);
    }

    /// Picks the active worker holding the tool with the greatest remaining
    /// capacity weight. Ties resolve to the lowest index, in insertion
    /// order.
    pub fn find_free_client(&self, tool_id: &ToolId) -> Option<usize> {
        let table = self.table.lock().unwrap();
        let mut best: Option<(usize, i64)> = None;
        for (index, state) in table.workers.iter().enumerate() {
            if !state.active || !state.endpoint.has_tool(tool_id) {
                continue;
            }
            let remaining = state.remaining();
            if remaining == 0 {
                continue;
            }
            let weight = remaining as i64 * state.each_task_weight as i64;
            if best.map_or(true, |(_, best_weight)| weight > best_weight) {
                best = Some((index, weight));
            }
        }
        best.map(|(index, _)| index)
    }

    pub fn start_task(&self, index: usize) {
        let mut table = self.table.lock().unwrap();
        if let Some(state) = table.workers.get_mut(index) {
            let capacity = state
                .endpoint
                .total_threads
                .saturating_sub(state.busy_others);
            state.busy_mine = state.busy_mine.saturating_add(1).min(capacity);
        }
        self.recalc_available(&table);
    }

    pub fn finish_task(&self, index: usize) {
        let mut table = self.table.lock().unwrap();
        if let Some(state) = table.workers.get_mut(index) {
            state.busy_mine = state.busy_mine.saturating_sub(1);
        }
        self.recalc_available(&table);
    }

    pub fn free_threads(&self) -> u16 {
        self.free_remote_threads.load(Ordering::Relaxed)
    }

    pub fn used_threads(&self) -> u16 {
        self.used_threads.load(Ordering::Relaxed)
    }

    pub fn total_threads(&self) -> u32 {
        let table = self.table.lock().unwrap();
        table
            .workers
            .iter()
            .filter(|state| state.active)
            .map(|state| state.endpoint.total_threads as u32)
            .sum()
    }

    pub fn is_all_active(&self) -> bool {
        let table = self.table.lock().unwrap();
        !table.workers.is_empty() && table.workers.iter().all(|state| state.active)
    }

    pub fn worker_count(&self) -> usize {
        self.table.lock().unwrap().workers.len()
    }

    fn recalc_available(&self, table: &BalancerTable) {
        let mut free: u16 = 0;
        let mut used: u16 = 0;
        for state in &table.workers {
            if state.active {
                free = free.saturating_add(state.remaining());
            }
            used = used.saturating_add(state.busy_mine);
        }
        self.free_remote_threads.store(free, Ordering::Relaxed);
        self.used_threads.store(used, Ordering::Relaxed);
    }

    #[cfg(test)]
    fn busy_snapshot(&self) -> Vec<(u16, u16)> {
        let table = self.table.lock().unwrap();
        table
            .workers
            .iter()
            .map(|state| (state.busy_mine, state.busy_others))
            .collect()
    }
}
