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

use std::path::Path;
use tracing::{debug, error};
use wuild_common::compression::{compress, decompress, CompressionError};
use wuild_common::model::CompressionKind;

#[derive(Debug, thiserror::Error)]
pub enum FileStoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to compress {path}: {source}")]
    Codec {
        path: String,
        #[source]
        source: CompressionError,
    },
}

/// Moves file payloads between disk and the wire codec.
pub trait FileStore: Send + Sync {
    /// Reads a file and returns its wire form, compressed with `kind`.
    fn read_compressed(&self, path: &Path, kind: CompressionKind)
        -> Result<Vec<u8>, FileStoreError>;

    /// Decompresses a wire payload and writes it to `path` atomically
    /// (written next to the target, then renamed into place).
    fn write_compressed(&self, path: &Path, data: &[u8], kind: CompressionKind) -> bool;
}

pub struct LocalFileStore;

impl FileStore for LocalFileStore {
    fn read_compressed(
        &self,
        path: &Path,
        kind: CompressionKind,
    ) -> Result<Vec<u8>, FileStoreError> {
        let raw = std::fs::read(path).map_err(|source| FileStoreError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let compressed = compress(&raw, kind).map_err(|source| FileStoreError::Codec {
            path: path.display().to_string(),
            source,
        })?;
        debug!(
            "compressed {}: {} -> {} bytes",
            path.display(),
            raw.len(),
            compressed.len()
        );
        Ok(compressed)
    }

    fn write_compressed(&self, path: &Path, data: &[u8], kind: CompressionKind) -> bool {
        let plain = match decompress(data, kind) {
            Ok(plain) => plain,
            Err(err) => {
                error!("error on uncompress for {}: {err}", path.display());
                return false;
            }
        };

        let tmp_path = {
            let mut name = path.as_os_str().to_os_string();
            name.push(".tmp");
            std::path::PathBuf::from(name)
        };
        if let Err(err) = std::fs::write(&tmp_path, &plain) {
            error!("error on writing {}: {err}", tmp_path.display());
            return false;
        }
        if let Err(err) = std::fs::rename(&tmp_path, path) {
            error!(
                "failed to rename {} -> {}: {err}",
                tmp_path.display(),
                path.display()
            );
            let _ = std::fs::remove_file(&tmp_path);
            return false;
        }
        true
    }
}
