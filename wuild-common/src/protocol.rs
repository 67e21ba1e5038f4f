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

use crate::model::{
    CompressionKind, SessionId, SessionInfo, ToolInvocation, WorkerEndpoint,
};
use bincode::{Decode, Encode};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const TOOL_REQUEST_VERSION: u32 = 1;
pub const TOOL_RESPONSE_VERSION: u32 = 2;

/// Upper bound for a single decoded frame body. Anything larger is treated
/// as a corrupt stream.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode frame: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
    #[error("frame body has {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("protocol version mismatch: expected {expected}, peer sent {actual}")]
    VersionMismatch { expected: u32, actual: u32 },
    #[error("channel i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct HelloFrame {
    pub protocol_version: u32,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ListResponseFrame {
    pub workers: Vec<WorkerEndpoint>,
    pub latest_sessions: Vec<SessionInfo>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct WorkerStatusFrame {
    pub worker: WorkerEndpoint,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct SessionUpdateFrame {
    pub session: SessionInfo,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ToolRequestFrame {
    pub invocation: ToolInvocation,
    pub file_data: Vec<u8>,
    pub compression: CompressionKind,
    pub session_id: SessionId,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ToolResponseFrame {
    pub result: bool,
    pub stdout: String,
    pub file_data: Vec<u8>,
    pub compression: CompressionKind,
    pub execution_time: Duration,
}

/// One logical message on a framed channel. The reader demultiplexes on the
/// variant tag.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Frame {
    Hello(HelloFrame),
    ListRequest,
    ListResponse(ListResponseFrame),
    WorkerStatus(WorkerStatusFrame),
    SessionUpdate(SessionUpdateFrame),
    ToolRequest(ToolRequestFrame),
    ToolResponse(ToolResponseFrame),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "hello",
            Frame::ListRequest => "list-request",
            Frame::ListResponse(_) => "list-response",
            Frame::WorkerStatus(_) => "worker-status",
            Frame::SessionUpdate(_) => "session-update",
            Frame::ToolRequest(_) => "tool-request",
            Frame::ToolResponse(_) => "tool-response",
        }
    }
}

/// Wire wrapper correlating requests with replies. `request_id == 0` marks
/// an unsolicited frame.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct FrameEnvelope {
    pub request_id: u64,
    pub frame: Frame,
}

pub fn encode_envelope(envelope: &FrameEnvelope) -> Result<Vec<u8>, ProtocolError> {
    let body = bincode::encode_to_vec(envelope, bincode::config::standard())?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode_envelope(body: &[u8]) -> Result<FrameEnvelope, ProtocolError> {
    let (envelope, consumed) =
        bincode::decode_from_slice(body, bincode::config::standard())?;
    if consumed != body.len() {
        return Err(ProtocolError::TrailingBytes(body.len() - consumed));
    }
    Ok(envelope)
}

/// Reads one length-prefixed envelope from the stream.
pub async fn read_envelope<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<FrameEnvelope, ProtocolError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_envelope(&body)
}

/// Writes one length-prefixed envelope and flushes the stream.
pub async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &FrameEnvelope,
) -> Result<(), ProtocolError> {
    let bytes = encode_envelope(envelope)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
