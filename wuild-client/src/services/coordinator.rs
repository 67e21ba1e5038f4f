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

use crate::config::CoordinatorClientConfig;
use crate::transport::FrameChannel;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use wuild_common::model::{SessionInfo, WorkerEndpoint};
use wuild_common::protocol::{
    Frame, ListResponseFrame, SessionUpdateFrame, WorkerStatusFrame,
};

pub type WorkerChangeCallback = Arc<dyn Fn(&WorkerEndpoint) + Send + Sync>;
pub type InfoArrivedCallback = Arc<dyn Fn(&[WorkerEndpoint], &[SessionInfo]) + Send + Sync>;

struct CoordinatorShared {
    config: CoordinatorClientConfig,
    channel: Mutex<Option<Arc<dyn FrameChannel>>>,
    client_state: AtomicBool,
    need_request_data: AtomicBool,
    need_send_info: AtomicBool,
    worker_info: Mutex<Option<WorkerEndpoint>>,
    last_send: Mutex<Option<Instant>>,
    roster: Mutex<HashMap<String, WorkerEndpoint>>,
    worker_change_callback: Mutex<Option<WorkerChangeCallback>>,
    info_arrived_callback: Mutex<Option<InfoArrivedCallback>>,
    shutdown: CancellationToken,
}

impl CoordinatorShared {
    fn quant(&self) {
        if !self.client_state.load(Ordering::Relaxed) {
            return;
        }
        let channel = self.channel.lock().unwrap().clone();
        let Some(channel) = channel else {
            return;
        };

        if !self.config.send_info_interval.is_zero()
            && self.need_send_info.load(Ordering::Relaxed)
        {
            let due = {
                let last_send = self.last_send.lock().unwrap();
                last_send.map_or(true, |sent| sent.elapsed() > self.config.send_info_interval)
            };
            if due {
                *self.last_send.lock().unwrap() = Some(Instant::now());
                self.need_send_info.store(false, Ordering::Relaxed);
                let info = self.worker_info.lock().unwrap().clone();
                if let Some(worker) = info {
                    debug!("sending worker status for {}", worker.worker_id);
                    channel.queue_frame(Frame::WorkerStatus(WorkerStatusFrame { worker }));
                }
            }
        }

        if self.need_request_data.swap(false, Ordering::Relaxed) {
            channel.queue_frame(Frame::ListRequest);
        }
    }

    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::ListResponse(response) => self.handle_list_response(response),
            other => debug!(
                "ignoring unexpected {} frame from the coordinator",
                other.kind()
            ),
        }
    }

    fn handle_list_response(&self, response: ListResponseFrame) {
        let (delta, full_roster) = {
            let mut roster = self.roster.lock().unwrap();
            let mut delta = Vec::new();
            for worker in response.workers {
                let changed = roster
                    .get(&worker.worker_id)
                    .map_or(true, |known| known.version_tag != worker.version_tag);
                if changed {
                    delta.push(worker.clone());
                }
                roster.insert(worker.worker_id.clone(), worker);
            }
            let full_roster: Vec<_> = roster.values().cloned().collect();
            (delta, full_roster)
        };
        debug!("worker list arrived [{}]", full_roster.len());

        if !delta.is_empty() {
            let callback = self.worker_change_callback.lock().unwrap().clone();
            if let Some(callback) = callback {
                for worker in &delta {
                    callback(worker);
                }
            }
        }
        let callback = self.info_arrived_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(&full_roster, &response.latest_sessions);
        }
    }
}

/// Periodic rendezvous with the coordinator: publishes local status, receives
/// the worker roster and session events. The coordinator is soft state;
/// losing it only pauses sending until the transport reconnects.
pub struct CoordinatorClient {
    shared: Arc<CoordinatorShared>,
    quant_task: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinatorClient {
    pub fn new(config: CoordinatorClientConfig) -> Self {
        Self {
            shared: Arc::new(CoordinatorShared {
                config,
                channel: Mutex::new(None),
                client_state: AtomicBool::new(false),
                need_request_data: AtomicBool::new(true),
                need_send_info: AtomicBool::new(false),
                worker_info: Mutex::new(None),
                last_send: Mutex::new(None),
                roster: Mutex::new(HashMap::new()),
                worker_change_callback: Mutex::new(None),
                info_arrived_callback: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
            quant_task: Mutex::new(None),
        }
    }

    pub fn set_worker_change_callback(&self, callback: WorkerChangeCallback) {
        *self.shared.worker_change_callback.lock().unwrap() = Some(callback);
    }

    pub fn set_info_arrived_callback(&self, callback: InfoArrivedCallback) {
        *self.shared.info_arrived_callback.lock().unwrap() = Some(callback);
    }

    /// Worker-role hook: remembers the local worker description and flags it
    /// for the next status send if it changed.
    pub fn set_worker_info(&self, info: WorkerEndpoint) {
        let mut current = self.shared.worker_info.lock().unwrap();
        if current.as_ref() == Some(&info) {
            return;
        }
        *current = Some(info);
        self.shared.need_send_info.store(true, Ordering::Relaxed);
    }

    pub fn send_session_info(&self, session: &SessionInfo, is_final: bool) {
        let channel = self.shared.channel.lock().unwrap().clone();
        let Some(channel) = channel else {
            return;
        };
        debug!("sending session info for {}", session.client_id);
        channel.queue_frame(Frame::SessionUpdate(SessionUpdateFrame {
            session: session.clone(),
            is_final,
        }));
    }

    /// Wires the channel and starts the quant loop. A disabled coordinator
    /// makes this a no-op.
    pub fn start(&self, channel: Arc<dyn FrameChannel>) {
        if !self.shared.config.enabled {
            return;
        }

        let weak: Weak<CoordinatorShared> = Arc::downgrade(&self.shared);
        channel.set_reader(Arc::new(move |frame| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_frame(frame);
            }
        }));
        let weak = Arc::downgrade(&self.shared);
        channel.set_notifier(Arc::new(move |state| {
            if let Some(shared) = weak.upgrade() {
                shared.client_state.store(state, Ordering::Relaxed);
                if !state {
                    shared.need_request_data.store(true, Ordering::Relaxed);
                }
            }
        }));
        *self.shared.channel.lock().unwrap() = Some(channel.clone());
        channel.start();

        let shared = self.shared.clone();
        *self.quant_task.lock().unwrap() = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(shared.config.quant_interval) => {}
                }
                shared.quant();
            }
        }));
    }

    pub async fn stop(&self) {
        self.shared.shutdown.cancel();
        let task = self.quant_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let channel = self.shared.channel.lock().unwrap().take();
        if let Some(channel) = channel {
            channel.stop().await;
        }
    }
}

impl Drop for CoordinatorClient {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
