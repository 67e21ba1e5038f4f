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

use crate::config::RemoteToolClientConfig;
use crate::file_store::FileStore;
use crate::invoker::LocalInvoker;
use crate::metrics;
use crate::model::TaskWrap;
use crate::services::balancer::ToolBalancer;
use crate::services::connection::WorkerConnectionPool;
use crate::services::coordinator::CoordinatorClient;
use crate::services::queue::RequestQueue;
use crate::services::session::SessionAccountant;
use crate::transport::FrameReply;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wuild_common::model::{TaskExecutionInfo, TaskId};
use wuild_common::protocol::Frame;

/// Everything one dispatch quant touches, shared with the facade.
pub struct DispatchContext {
    pub config: RemoteToolClientConfig,
    pub balancer: Arc<ToolBalancer>,
    pub queue: Arc<RequestQueue>,
    pub pool: Arc<WorkerConnectionPool>,
    pub session: Arc<SessionAccountant>,
    pub coordinator: Option<Arc<CoordinatorClient>>,
    pub file_store: Arc<dyn FileStore>,
    pub invoker_fallback: Arc<Mutex<Option<Arc<dyn LocalInvoker>>>>,
    pub task_counter: Arc<AtomicU64>,
    pub shutdown: CancellationToken,
}

/// Runs the dispatch quant until shutdown: expire, pick a worker, hand the
/// frame to the channel, route the reply. Immediate while work remains,
/// otherwise one short sleep per quant.
pub fn spawn_dispatch_loop(context: Arc<DispatchContext>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if context.shutdown.is_cancelled() {
                break;
            }
            let dispatched = process_tasks(&context);
            if !dispatched {
                tokio::select! {
                    _ = context.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(context.config.dispatch_quant) => {}
                }
            }
        }
    })
}

/// One quant. Returns whether a task was handed to a channel, which makes
/// the loop re-run immediately.
fn process_tasks(context: &Arc<DispatchContext>) -> bool {
    let now = Instant::now();
    for task in context.queue.drain_expired(now) {
        expire_task(context, task);
    }

    let Some(tool_id) = context.queue.front_tool_id() else {
        return false;
    };
    let Some(worker_index) = context.balancer.find_free_client(&tool_id) else {
        return false;
    };
    // The queue only grows at the tail and this loop is the only consumer,
    // so the front observed above is still the front here.
    let Some(task) = context.queue.pop_front() else {
        return false;
    };
    context.balancer.start_task(worker_index);

    let Some(channel) = context.pool.get(worker_index) else {
        // Balancer indices and the channel pool grow in lockstep; a miss
        // here means the roster wiring is broken.
        error!(
            "no channel for worker index {worker_index}, requeueing task {}",
            task.task_id
        );
        context.balancer.finish_task(worker_index);
        context.queue.push(task);
        return false;
    };

    debug!(
        "dispatching task {} ({} {}) to worker {}, attempts remain: {}",
        task.task_id,
        task.rewritten_invocation.tool_id,
        task.rewritten_invocation.args_string(),
        worker_index,
        task.attempts_remain
    );
    let reply = channel.queue_frame_with_reply(
        Frame::ToolRequest(task.request.clone()),
        task.per_request_timeout,
    );
    tokio::spawn(handle_reply(context.clone(), task, worker_index, reply));
    true
}

fn expire_task(context: &Arc<DispatchContext>, task: TaskWrap) {
    error!(
        "task {} expired in queue after {:?}",
        task.task_id,
        task.enqueue_time.elapsed()
    );
    metrics::EXPIRED_TASKS.inc();
    let fallback = context.invoker_fallback.lock().unwrap().clone();
    match fallback {
        Some(invoker) => {
            info!("using local invoker fallback for task {}", task.task_id);
            invoker.invoke_tool(task.original_invocation, task.callback);
        }
        None => {
            (task.callback)(TaskExecutionInfo::failed("Timeout expired."));
        }
    }
}

async fn handle_reply(
    context: Arc<DispatchContext>,
    task: TaskWrap,
    worker_index: usize,
    reply: oneshot::Receiver<FrameReply>,
) {
    let reply = reply
        .await
        .unwrap_or_else(|_| FrameReply::Error("reply channel closed".to_string()));
    context.balancer.finish_task(worker_index);

    let output_file = task.original_invocation.output_file.clone();
    let mut info = TaskExecutionInfo::default();
    let mut retry = false;
    match reply {
        FrameReply::Timeout => {
            info.stdout = format!(
                "Timeout expired: task {}, attempts remain: {}, balancer free: {}",
                task.task_id,
                task.attempts_remain,
                context.balancer.free_threads()
            );
            retry = true;
        }
        FrameReply::Error(message) => {
            info.stdout = format!("Internal error. {message}");
            retry = true;
        }
        FrameReply::Success(frame) => match *frame {
            Frame::ToolResponse(response) => {
                info.tool_execution_time = response.execution_time;
                info.network_request_time = task.start.elapsed();
                info.result = response.result;
                info.stdout = response.stdout.replace('\r', " ");
                if info.result {
                    if let Some(path) = &output_file {
                        info.result = context.file_store.write_compressed(
                            path,
                            &response.file_data,
                            response.compression,
                        );
                    }
                }
            }
            other => {
                info.stdout = format!("Internal error. Unexpected {} frame.", other.kind());
                retry = true;
            }
        },
    }

    if retry && task.attempts_remain > 0 {
        warn!(
            "{} Retrying ({} attempts remain), args: {}",
            info.stdout,
            task.attempts_remain,
            task.rewritten_invocation.args_string()
        );
        metrics::RETRIED_DISPATCHES.inc();
        let mut task = task;
        task.attempts_remain -= 1;
        task.task_id = TaskId(context.task_counter.fetch_add(1, Ordering::Relaxed) + 1);
        task.expiration_time = Instant::now() + context.config.queue_timeout;
        context.queue.push(task);
        return;
    }

    let snapshot = context
        .session
        .update(&info, context.balancer.used_threads());
    if let Some(coordinator) = &context.coordinator {
        coordinator.send_session_info(&snapshot, false);
    }
    metrics::COMPLETED_TASKS.inc();
    if !info.result {
        metrics::FAILED_TASKS.inc();
    }
    debug!("task {} finished: {}", task.task_id, info.profiling_str());
    (task.callback)(info);
}
