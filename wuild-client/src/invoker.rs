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

use crate::model::InvokeCallback;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::debug;
use wuild_common::model::{TaskExecutionInfo, ToolId, ToolInvocation};

/// Executes a tool on the local host and notifies the caller when it
/// finishes. Target of the queue-expiration fallback.
pub trait LocalInvoker: Send + Sync {
    fn invoke_tool(&self, invocation: ToolInvocation, callback: InvokeCallback);
}

/// Runs tools as local subprocesses, resolving the tool id through a
/// configured program table.
pub struct LocalProcessInvoker {
    tools: HashMap<ToolId, PathBuf>,
}

impl LocalProcessInvoker {
    pub fn new(tools: HashMap<ToolId, PathBuf>) -> Self {
        Self { tools }
    }

    pub fn tool_ids(&self) -> Vec<ToolId> {
        self.tools.keys().cloned().collect()
    }
}

impl LocalInvoker for LocalProcessInvoker {
    fn invoke_tool(&self, invocation: ToolInvocation, callback: InvokeCallback) {
        let Some(program) = self.tools.get(&invocation.tool_id).cloned() else {
            callback(TaskExecutionInfo::failed(format!(
                "no local program for tool {}",
                invocation.tool_id
            )));
            return;
        };

        tokio::spawn(async move {
            debug!(
                "running {} {} locally",
                program.display(),
                invocation.args_string()
            );
            let start = Instant::now();
            let output = tokio::process::Command::new(&program)
                .args(&invocation.args)
                .output()
                .await;
            let info = match output {
                Ok(output) => {
                    let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                    stdout.push_str(&String::from_utf8_lossy(&output.stderr));
                    TaskExecutionInfo {
                        result: output.status.success(),
                        stdout,
                        tool_execution_time: start.elapsed(),
                        network_request_time: Default::default(),
                    }
                }
                Err(err) => TaskExecutionInfo::failed(format!(
                    "failed to run {}: {err}",
                    program.display()
                )),
            };
            callback(info);
        });
    }
}
