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

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wuild_common::model::RetryConfig;
use wuild_common::protocol::{
    read_envelope, write_envelope, Frame, FrameEnvelope, HelloFrame, TOOL_REQUEST_VERSION,
    TOOL_RESPONSE_VERSION,
};

/// Terminal state of one queued request; delivered exactly once, even on
/// channel teardown.
#[derive(Debug)]
pub enum FrameReply {
    Success(Box<Frame>),
    Timeout,
    Error(String),
}

pub type ChannelNotifier = Arc<dyn Fn(bool) + Send + Sync>;
pub type FrameReader = Arc<dyn Fn(Frame) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub protocol_version: u32,
    pub recv_buffer_size: usize,
    pub send_buffer_size: usize,
    pub segment_size: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            protocol_version: TOOL_REQUEST_VERSION + TOOL_RESPONSE_VERSION,
            recv_buffer_size: 64 * 1024,
            send_buffer_size: 64 * 1024,
            segment_size: 8 * 1024,
        }
    }
}

/// One framed bidirectional channel to a peer. FIFO per channel; no ordering
/// across channels.
#[async_trait]
pub trait FrameChannel: Send + Sync {
    /// Sends an unsolicited frame, best effort.
    fn queue_frame(&self, frame: Frame);

    /// Sends a request frame; the receiver resolves exactly once with
    /// success, timeout, or error.
    fn queue_frame_with_reply(
        &self,
        frame: Frame,
        timeout: Duration,
    ) -> oneshot::Receiver<FrameReply>;

    /// Installs the connect/disconnect observer.
    fn set_notifier(&self, notifier: ChannelNotifier);

    /// Installs the handler for unsolicited inbound frames.
    fn set_reader(&self, reader: FrameReader);

    /// Starts the channel's background work. Must be called on a runtime.
    fn start(&self);

    async fn stop(&self);
}

struct ChannelShared {
    host: String,
    port: u16,
    settings: ChannelSettings,
    reconnect: RetryConfig,
    pending: Mutex<HashMap<u64, oneshot::Sender<FrameReply>>>,
    notifier: Mutex<Option<ChannelNotifier>>,
    reader: Mutex<Option<FrameReader>>,
    shutdown: CancellationToken,
}

impl ChannelShared {
    fn notify(&self, state: bool) {
        let notifier = self.notifier.lock().unwrap().clone();
        if let Some(notifier) = notifier {
            notifier(state);
        }
    }

    fn resolve(&self, request_id: u64, reply: FrameReply) -> bool {
        let sender = self.pending.lock().unwrap().remove(&request_id);
        match sender {
            Some(sender) => {
                let _ = sender.send(reply);
                true
            }
            None => false,
        }
    }

    fn dispatch_inbound(&self, envelope: FrameEnvelope) {
        let sender = if envelope.request_id != 0 {
            self.pending.lock().unwrap().remove(&envelope.request_id)
        } else {
            None
        };
        match sender {
            Some(sender) => {
                let _ = sender.send(FrameReply::Success(Box::new(envelope.frame)));
            }
            None => self.deliver_unsolicited(envelope.frame),
        }
    }

    fn deliver_unsolicited(&self, frame: Frame) {
        let reader = self.reader.lock().unwrap().clone();
        match reader {
            Some(reader) => reader(frame),
            None => debug!(
                peer = %self.peer(),
                "dropping unsolicited {} frame, no reader installed",
                frame.kind()
            ),
        }
    }

    fn fail_pending(&self, message: &str) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect()
        };
        for (_, sender) in drained {
            let _ = sender.send(FrameReply::Error(message.to_string()));
        }
    }

    fn peer(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Framed channel over a TCP stream, reconnecting with backoff for as long
/// as it is not stopped.
pub struct TcpFrameChannel {
    shared: Arc<ChannelShared>,
    next_request_id: AtomicU64,
    outgoing_tx: mpsc::UnboundedSender<FrameEnvelope>,
    outgoing_rx: Mutex<Option<mpsc::UnboundedReceiver<FrameEnvelope>>>,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpFrameChannel {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        settings: ChannelSettings,
        reconnect: RetryConfig,
    ) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(ChannelShared {
                host: host.into(),
                port,
                settings,
                reconnect,
                pending: Mutex::new(HashMap::new()),
                notifier: Mutex::new(None),
                reader: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
            next_request_id: AtomicU64::new(0),
            outgoing_tx,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            run_task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl FrameChannel for TcpFrameChannel {
    fn queue_frame(&self, frame: Frame) {
        let envelope = FrameEnvelope {
            request_id: 0,
            frame,
        };
        if self.outgoing_tx.send(envelope).is_err() {
            debug!(peer = %self.shared.peer(), "dropping frame, channel stopped");
        }
    }

    fn queue_frame_with_reply(
        &self,
        frame: Frame,
        timeout: Duration,
    ) -> oneshot::Receiver<FrameReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.shared
            .pending
            .lock()
            .unwrap()
            .insert(request_id, reply_tx);

        let envelope = FrameEnvelope { request_id, frame };
        if self.outgoing_tx.send(envelope).is_err() {
            self.shared
                .resolve(request_id, FrameReply::Error("channel stopped".to_string()));
            return reply_rx;
        }

        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.shutdown.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    shared.resolve(request_id, FrameReply::Timeout);
                }
            }
        });
        reply_rx
    }

    fn set_notifier(&self, notifier: ChannelNotifier) {
        *self.shared.notifier.lock().unwrap() = Some(notifier);
    }

    fn set_reader(&self, reader: FrameReader) {
        *self.shared.reader.lock().unwrap() = Some(reader);
    }

    fn start(&self) {
        let receiver = self.outgoing_rx.lock().unwrap().take();
        let Some(receiver) = receiver else {
            return;
        };
        let shared = self.shared.clone();
        *self.run_task.lock().unwrap() = Some(tokio::spawn(run(shared, receiver)));
    }

    async fn stop(&self) {
        self.shared.shutdown.cancel();
        let task = self.run_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.shared.fail_pending("channel stopped");
    }
}

impl Drop for TcpFrameChannel {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        self.shared.fail_pending("channel dropped");
    }
}

enum ConnectionEnd {
    Stopped,
    Lost(String),
}

async fn run(shared: Arc<ChannelShared>, mut outgoing: mpsc::UnboundedReceiver<FrameEnvelope>) {
    let mut failures: u32 = 0;
    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }
        match TcpStream::connect((shared.host.as_str(), shared.port)).await {
            Ok(stream) => {
                failures = 0;
                match serve_connection(&shared, stream, &mut outgoing).await {
                    ConnectionEnd::Stopped => break,
                    ConnectionEnd::Lost(reason) => {
                        info!(peer = %shared.peer(), "channel lost: {reason}");
                        shared.notify(false);
                        shared.fail_pending(&reason);
                    }
                }
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                debug!(peer = %shared.peer(), "connect failed: {err}");
                if shared.reconnect.is_exhausted(failures) {
                    warn!(
                        peer = %shared.peer(),
                        "giving up after {failures} failed connect attempts"
                    );
                    shared.fail_pending("reconnect attempts exhausted");
                    break;
                }
            }
        }
        let delay = shared.reconnect.delay_for(failures.max(1));
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    shared.fail_pending("channel stopped");
}

async fn serve_connection(
    shared: &Arc<ChannelShared>,
    stream: TcpStream,
    outgoing: &mut mpsc::UnboundedReceiver<FrameEnvelope>,
) -> ConnectionEnd {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(peer = %shared.peer(), "failed to disable Nagle: {err}");
    }
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::with_capacity(shared.settings.recv_buffer_size, read_half);
    let mut writer = BufWriter::with_capacity(shared.settings.send_buffer_size, write_half);

    let hello = FrameEnvelope {
        request_id: 0,
        frame: Frame::Hello(HelloFrame {
            protocol_version: shared.settings.protocol_version,
        }),
    };
    if let Err(err) = write_envelope(&mut writer, &hello).await {
        return ConnectionEnd::Lost(format!("handshake send failed: {err}"));
    }
    match read_envelope(&mut reader).await {
        Ok(envelope) => match envelope.frame {
            Frame::Hello(peer_hello)
                if peer_hello.protocol_version == shared.settings.protocol_version => {}
            Frame::Hello(peer_hello) => {
                warn!(
                    peer = %shared.peer(),
                    "protocol version mismatch: ours {} theirs {}",
                    shared.settings.protocol_version,
                    peer_hello.protocol_version
                );
                return ConnectionEnd::Lost("protocol version mismatch".to_string());
            }
            other => {
                return ConnectionEnd::Lost(format!(
                    "expected hello, peer sent {}",
                    other.kind()
                ));
            }
        },
        Err(err) => return ConnectionEnd::Lost(format!("handshake read failed: {err}")),
    }

    info!(peer = %shared.peer(), "channel established");
    shared.notify(true);

    let read_shared = shared.clone();
    let mut read_task = tokio::spawn(async move {
        loop {
            match read_envelope(&mut reader).await {
                Ok(envelope) => read_shared.dispatch_inbound(envelope),
                Err(err) => return format!("read failed: {err}"),
            }
        }
    });

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                read_task.abort();
                return ConnectionEnd::Stopped;
            }
            reason = &mut read_task => {
                let reason = reason.unwrap_or_else(|_| "reader task aborted".to_string());
                return ConnectionEnd::Lost(reason);
            }
            message = outgoing.recv() => match message {
                Some(envelope) => {
                    if let Err(err) = send_segmented(shared, &mut writer, &envelope).await {
                        read_task.abort();
                        return ConnectionEnd::Lost(format!("write failed: {err}"));
                    }
                }
                None => {
                    read_task.abort();
                    return ConnectionEnd::Stopped;
                }
            }
        }
    }
}

async fn send_segmented<W: tokio::io::AsyncWrite + Unpin>(
    shared: &Arc<ChannelShared>,
    writer: &mut W,
    envelope: &FrameEnvelope,
) -> Result<(), wuild_common::protocol::ProtocolError> {
    use tokio::io::AsyncWriteExt;

    let bytes = wuild_common::protocol::encode_envelope(envelope)?;
    for segment in bytes.chunks(shared.settings.segment_size) {
        writer.write_all(segment).await?;
    }
    writer.flush().await?;
    Ok(())
}
