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

#[cfg(test)]
test_r::enable!();

pub mod client;
pub mod config;
pub mod file_store;
pub mod invoker;
pub mod metrics;
pub mod model;
pub mod rewriter;
pub mod services;
pub mod transport;

pub use client::{ChannelFactory, RemoteAvailableCallback, RemoteToolClient};
pub use config::{CoordinatorClientConfig, RemoteToolClientConfig};
pub use model::{InvokeCallback, TaskWrap};
