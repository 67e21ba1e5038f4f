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

use crate::transport::FrameChannel;
use std::sync::{Arc, Mutex};

/// Owns one framed channel per known worker, index-aligned with the
/// balancer's worker arena. The lock is held only during add and index
/// resolution.
pub struct WorkerConnectionPool {
    channels: Mutex<Vec<Arc<dyn FrameChannel>>>,
}

impl Default for WorkerConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerConnectionPool {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, channel: Arc<dyn FrameChannel>) -> usize {
        let mut channels = self.channels.lock().unwrap();
        channels.push(channel);
        channels.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<Arc<dyn FrameChannel>> {
        self.channels.lock().unwrap().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().unwrap().is_empty()
    }

    pub fn start_all(&self) {
        let channels: Vec<_> = self.channels.lock().unwrap().clone();
        for channel in channels {
            channel.start();
        }
    }

    pub async fn stop_all(&self) {
        let channels: Vec<_> = self.channels.lock().unwrap().clone();
        for channel in channels {
            channel.stop().await;
        }
    }
}
