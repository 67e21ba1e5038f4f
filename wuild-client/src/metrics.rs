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

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};

pub static COMPLETED_TASKS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "wuild_client_completed_tasks_total",
        "Number of tool tasks whose final outcome was delivered to the caller"
    )
    .unwrap()
});

pub static FAILED_TASKS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "wuild_client_failed_tasks_total",
        "Number of tool tasks delivered with a failed result"
    )
    .unwrap()
});

pub static RETRIED_DISPATCHES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "wuild_client_retried_dispatches_total",
        "Number of dispatches re-enqueued after a transport timeout or error"
    )
    .unwrap()
});

pub static EXPIRED_TASKS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "wuild_client_expired_tasks_total",
        "Number of tool tasks that expired in the queue before dispatch"
    )
    .unwrap()
});

pub static PENDING_TASKS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "wuild_client_pending_tasks",
        "Number of tool tasks currently waiting in the request queue"
    )
    .unwrap()
});

/// Forces registration of every metric in the default registry.
pub fn register_all() {
    Lazy::force(&COMPLETED_TASKS);
    Lazy::force(&FAILED_TASKS);
    Lazy::force(&RETRIED_DISPATCHES);
    Lazy::force(&EXPIRED_TASKS);
    Lazy::force(&PENDING_TASKS);
}
