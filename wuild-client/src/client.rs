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
use crate::file_store::{FileStore, LocalFileStore};
use crate::invoker::LocalInvoker;
use crate::model::{InvokeCallback, TaskWrap};
use crate::rewriter::InvocationRewriter;
use crate::services::balancer::{ClientUpdate, ToolBalancer};
use crate::services::connection::WorkerConnectionPool;
use crate::services::coordinator::CoordinatorClient;
use crate::services::dispatch::{spawn_dispatch_loop, DispatchContext};
use crate::services::queue::RequestQueue;
use crate::services::session::SessionAccountant;
use crate::transport::{ChannelSettings, FrameChannel, TcpFrameChannel};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wuild_common::model::{
    RetryConfig, SessionId, TaskExecutionInfo, TaskId, ToolId, ToolInvocation, WorkerEndpoint,
};
use wuild_common::protocol::ToolRequestFrame;

/// Fired once, when every known worker is active and free capacity first
/// appears.
pub type RemoteAvailableCallback = Box<dyn FnOnce() + Send + 'static>;

/// Builds a framed channel to `host:port`. Swapped out in tests.
pub type ChannelFactory =
    Arc<dyn Fn(&str, u16, ChannelSettings, RetryConfig) -> Arc<dyn FrameChannel> + Send + Sync>;

struct AvailabilityState {
    fired: bool,
    callback: Option<RemoteAvailableCallback>,
}

struct ClientInner {
    config: Mutex<RemoteToolClientConfig>,
    rewriter: Arc<dyn InvocationRewriter>,
    file_store: Arc<dyn FileStore>,
    channel_factory: ChannelFactory,
    balancer: Arc<ToolBalancer>,
    queue: Arc<RequestQueue>,
    pool: Arc<WorkerConnectionPool>,
    session: Arc<SessionAccountant>,
    coordinator: Mutex<Option<Arc<CoordinatorClient>>>,
    invoker_fallback: Arc<Mutex<Option<Arc<dyn LocalInvoker>>>>,
    task_counter: Arc<AtomicU64>,
    session_id: Mutex<SessionId>,
    started: AtomicBool,
    availability: Mutex<AvailabilityState>,
    // Serializes roster wiring so balancer and pool indices stay aligned.
    wiring: Mutex<()>,
    shutdown: CancellationToken,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

/// Client-side dispatch engine: offloads tool invocations to remote workers
/// discovered through the coordinator, with retry, queue expiration, and
/// local fallback.
pub struct RemoteToolClient {
    inner: Arc<ClientInner>,
}

impl RemoteToolClient {
    pub fn new(rewriter: Arc<dyn InvocationRewriter>) -> Self {
        let factory: ChannelFactory = Arc::new(|host, port, settings, reconnect| {
            Arc::new(TcpFrameChannel::new(host, port, settings, reconnect))
                as Arc<dyn FrameChannel>
        });
        Self::with_transport(rewriter, Arc::new(LocalFileStore), factory)
    }

    pub fn with_transport(
        rewriter: Arc<dyn InvocationRewriter>,
        file_store: Arc<dyn FileStore>,
        channel_factory: ChannelFactory,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config: Mutex::new(RemoteToolClientConfig::default()),
                rewriter,
                file_store,
                channel_factory,
                balancer: Arc::new(ToolBalancer::new()),
                queue: Arc::new(RequestQueue::new()),
                pool: Arc::new(WorkerConnectionPool::new()),
                session: Arc::new(SessionAccountant::new()),
                coordinator: Mutex::new(None),
                invoker_fallback: Arc::new(Mutex::new(None)),
                task_counter: Arc::new(AtomicU64::new(0)),
                session_id: Mutex::new(SessionId::default()),
                started: AtomicBool::new(false),
                availability: Mutex::new(AvailabilityState {
                    fired: false,
                    callback: None,
                }),
                wiring: Mutex::new(()),
                shutdown: CancellationToken::new(),
                dispatch_task: Mutex::new(None),
            }),
        }
    }

    /// Validates and installs the configuration. Returns false (and logs)
    /// when the config is unusable; the client must not be started then.
    pub fn set_config(&self, config: RemoteToolClientConfig) -> bool {
        if let Err(err) = config.validate() {
            error!("invalid remote tool client config: {err}");
            return false;
        }
        *self.inner.config.lock().unwrap() = config;
        true
    }

    pub fn set_invoker_fallback(&self, invoker: Arc<dyn LocalInvoker>) {
        *self.inner.invoker_fallback.lock().unwrap() = Some(invoker);
    }

    pub fn set_remote_available_callback(&self, callback: RemoteAvailableCallback) {
        self.inner.availability.lock().unwrap().callback = Some(callback);
    }

    /// Starts the session: seeds the balancer, opens existing channels, and
    /// brings up the coordinator rendezvous and the dispatch loop. Must be
    /// called on a runtime.
    pub fn start(&self, required_tool_ids: Vec<ToolId>) {
        let config = self.inner.config.lock().unwrap().clone();
        let session_id = SessionId::from_current_time();
        *self.inner.session_id.lock().unwrap() = session_id;
        self.inner.balancer.set_required_tools(required_tool_ids);
        self.inner.balancer.set_session_id(session_id);
        self.inner
            .session
            .start_session(session_id, &config.client_id);
        self.inner.started.store(true, Ordering::SeqCst);
        self.inner.pool.start_all();

        let coordinator = if config.coordinator.enabled {
            let coordinator = Arc::new(CoordinatorClient::new(config.coordinator.clone()));
            let weak = Arc::downgrade(&self.inner);
            coordinator.set_info_arrived_callback(Arc::new(move |workers, _sessions| {
                if let Some(inner) = weak.upgrade() {
                    for worker in workers {
                        Self::add_worker_inner(&inner, worker, true);
                    }
                }
            }));
            let channel = (self.inner.channel_factory)(
                &config.coordinator.host,
                config.coordinator.port,
                ChannelSettings::default(),
                config.reconnect.clone(),
            );
            coordinator.start(channel);
            *self.inner.coordinator.lock().unwrap() = Some(coordinator.clone());
            Some(coordinator)
        } else {
            None
        };

        let context = Arc::new(DispatchContext {
            config,
            balancer: self.inner.balancer.clone(),
            queue: self.inner.queue.clone(),
            pool: self.inner.pool.clone(),
            session: self.inner.session.clone(),
            coordinator,
            file_store: self.inner.file_store.clone(),
            invoker_fallback: self.inner.invoker_fallback.clone(),
            task_counter: self.inner.task_counter.clone(),
            shutdown: self.inner.shutdown.clone(),
        });
        *self.inner.dispatch_task.lock().unwrap() = Some(spawn_dispatch_loop(context));
    }

    /// Feeds one roster entry in: refreshes the balancer and, on first
    /// sighting, opens a channel whose notifier drives the worker's
    /// availability.
    pub fn add_worker(&self, endpoint: &WorkerEndpoint, start: bool) {
        Self::add_worker_inner(&self.inner, endpoint, start);
    }

    fn add_worker_inner(inner: &Arc<ClientInner>, endpoint: &WorkerEndpoint, start: bool) {
        let _wiring = inner.wiring.lock().unwrap();
        let update = inner.balancer.update_client(endpoint.clone());
        let index = match update {
            ClientUpdate::Skipped => return,
            ClientUpdate::Updated(_) => {
                Self::availability_check(inner);
                return;
            }
            ClientUpdate::Added(index) => {
                Self::availability_check(inner);
                index
            }
        };

        debug!("adding worker channel for {endpoint}");
        let reconnect = inner.config.lock().unwrap().reconnect.clone();
        let channel = (inner.channel_factory)(
            &endpoint.host,
            endpoint.port,
            ChannelSettings::default(),
            reconnect,
        );
        let balancer = inner.balancer.clone();
        let weak = Arc::downgrade(inner);
        channel.set_notifier(Arc::new(move |state| {
            balancer.set_client_active(index, state);
            if let Some(inner) = weak.upgrade() {
                Self::availability_check(&inner);
            }
        }));
        let pool_index = inner.pool.add(channel.clone());
        debug_assert_eq!(pool_index, index);
        if start {
            channel.start();
        }
    }

    /// Reads the input file (in wire form), rewrites the invocation for the
    /// remote side, and queues the task. Unreadable input fails the task
    /// immediately through the callback.
    pub fn invoke_tool(&self, invocation: ToolInvocation, callback: InvokeCallback) {
        let start = Instant::now();
        let config = self.inner.config.lock().unwrap().clone();

        let mut file_data = Vec::new();
        if let Some(input) = &invocation.input_file {
            match self
                .inner
                .file_store
                .read_compressed(input, config.compression)
            {
                Ok(data) => file_data = data,
                Err(err) => {
                    warn!("{err}");
                    callback(TaskExecutionInfo::failed(format!(
                        "failed to read {}",
                        input.display()
                    )));
                    return;
                }
            }
        }

        let rewritten = self.inner.rewriter.prepare_remote(&invocation);
        let session_id = *self.inner.session_id.lock().unwrap();
        let request = ToolRequestFrame {
            invocation: rewritten.clone(),
            file_data,
            compression: config.compression,
            session_id,
            client_id: config.client_id.clone(),
        };
        let task_id = TaskId(self.inner.task_counter.fetch_add(1, Ordering::Relaxed) + 1);
        let task = TaskWrap {
            task_id,
            original_invocation: invocation,
            rewritten_invocation: rewritten,
            request,
            callback,
            start,
            enqueue_time: start,
            expiration_time: start + config.queue_timeout,
            per_request_timeout: config.request_timeout,
            attempts_remain: config.invocation_attempts.saturating_sub(1),
        };
        debug!(
            "queueing task {} -> {} {}, balancer free: {}, pending: {}",
            task.task_id,
            task.rewritten_invocation.tool_id,
            task.rewritten_invocation.args_string(),
            self.inner.balancer.free_threads(),
            self.inner.queue.pending()
        );
        self.inner.queue.push(task);
    }

    /// Sends the final session frame. Safe to call more than once.
    pub fn finish_session(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(final_info) = self.inner.session.finish() {
            let coordinator = self.inner.coordinator.lock().unwrap().clone();
            if let Some(coordinator) = coordinator {
                coordinator.send_session_info(&final_info, true);
            }
        }
    }

    /// Free worker capacity minus queued work; negative means the queue
    /// already overcommits the known workers.
    pub fn get_free_remote_threads(&self) -> i32 {
        self.inner.balancer.free_threads() as i32 - self.inner.queue.pending()
    }

    /// Whether offloading is currently worth it, per the configured
    /// `minimal_remote_tasks` threshold.
    pub fn has_remote_capacity(&self) -> bool {
        let minimal = self.inner.config.lock().unwrap().minimal_remote_tasks;
        self.get_free_remote_threads() >= minimal
    }

    pub fn session_info(&self) -> wuild_common::model::SessionInfo {
        self.inner.session.snapshot()
    }

    fn availability_check(inner: &Arc<ClientInner>) {
        let mut availability = inner.availability.lock().unwrap();
        if availability.fired {
            return;
        }
        if inner.balancer.is_all_active() && inner.balancer.free_threads() > 0 {
            availability.fired = true;
            let callback = availability.callback.take();
            drop(availability);
            info!(
                "remote capacity available: total threads={}, free={}",
                inner.balancer.total_threads(),
                inner.balancer.free_threads()
            );
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    /// Orderly teardown: the cancellation token stops every cooperative loop
    /// at its next quant, then the dispatch loop is joined first, then the
    /// coordinator, then every worker channel, so nothing can call back into
    /// a half-dropped facade.
    pub async fn stop(&self) {
        self.finish_session();
        self.inner.shutdown.cancel();
        let task = self.inner.dispatch_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let coordinator = self.inner.coordinator.lock().unwrap().take();
        if let Some(coordinator) = coordinator {
            coordinator.stop().await;
        }
        self.inner.pool.stop_all().await;
    }
}

impl Drop for RemoteToolClient {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}
