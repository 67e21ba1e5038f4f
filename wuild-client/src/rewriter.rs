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

use std::path::{Path, PathBuf};
use wuild_common::model::ToolInvocation;

/// Turns a local invocation into the form a remote worker sees.
pub trait InvocationRewriter: Send + Sync {
    fn prepare_remote(&self, invocation: &ToolInvocation) -> ToolInvocation;
}

/// Strips directories from the file references so the worker operates on
/// bare names in its own scratch space; arguments naming those files are
/// rewritten to match.
pub struct BasenameRewriter;

impl BasenameRewriter {
    fn bare_name(path: &Path) -> PathBuf {
        path.file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| path.to_path_buf())
    }
}

impl InvocationRewriter for BasenameRewriter {
    fn prepare_remote(&self, invocation: &ToolInvocation) -> ToolInvocation {
        let mut remote = invocation.clone();
        for original in [&invocation.input_file, &invocation.output_file]
            .into_iter()
            .flatten()
        {
            let bare = Self::bare_name(original);
            let original_str = original.to_string_lossy();
            let bare_str = bare.to_string_lossy().into_owned();
            for arg in &mut remote.args {
                if *arg == original_str {
                    *arg = bare_str.clone();
                }
            }
        }
        remote.input_file = invocation.input_file.as_deref().map(Self::bare_name);
        remote.output_file = invocation.output_file.as_deref().map(Self::bare_name);
        remote
    }
}
