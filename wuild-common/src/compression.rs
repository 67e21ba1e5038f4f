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

use crate::model::CompressionKind;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("compression failed: {0}")]
    Compress(#[source] std::io::Error),
    #[error("decompression failed: {0}")]
    Decompress(#[source] std::io::Error),
}

pub fn compress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>, CompressionError> {
    match kind {
        CompressionKind::None => Ok(data.to_vec()),
        CompressionKind::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(data)
                .map_err(CompressionError::Compress)?;
            encoder.finish().map_err(CompressionError::Compress)
        }
    }
}

pub fn decompress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>, CompressionError> {
    match kind {
        CompressionKind::None => Ok(data.to_vec()),
        CompressionKind::Gzip => {
            let mut decoder = GzDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(CompressionError::Decompress)?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn gzip_round() {
        let payload = b"int main() { return 0; }".repeat(64);
        let compressed = compress(&payload, CompressionKind::Gzip).unwrap();
        assert!(compressed.len() < payload.len());
        let restored = decompress(&compressed, CompressionKind::Gzip).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn none_is_passthrough() {
        let payload = b"raw bytes".to_vec();
        assert_eq!(compress(&payload, CompressionKind::None).unwrap(), payload);
        assert_eq!(decompress(&payload, CompressionKind::None).unwrap(), payload);
    }

    #[test]
    fn corrupt_gzip_is_an_error() {
        let result = decompress(b"definitely not gzip", CompressionKind::Gzip);
        assert!(result.is_err());
    }
}
