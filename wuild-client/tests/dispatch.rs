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
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use test_r::{test, test_dep};
use tokio::sync::oneshot;
use wuild_client::config::{CoordinatorClientConfig, RemoteToolClientConfig};
use wuild_client::file_store::LocalFileStore;
use wuild_client::invoker::LocalInvoker;
use wuild_client::model::InvokeCallback;
use wuild_client::rewriter::BasenameRewriter;
use wuild_client::transport::{
    ChannelNotifier, ChannelSettings, FrameChannel, FrameReader, FrameReply,
};
use wuild_client::{ChannelFactory, RemoteToolClient};
use wuild_common::model::{
    CompressionKind, TaskExecutionInfo, ToolId, ToolInvocation, WorkerEndpoint,
};
use wuild_common::protocol::{Frame, ToolRequestFrame, ToolResponseFrame};
use wuild_common::tracing::{init_tracing_with_default_env_filter, TracingConfig};

test_r::enable!();

#[derive(Debug)]
pub struct Tracing;

impl Tracing {
    pub fn init() -> Self {
        init_tracing_with_default_env_filter(
            &TracingConfig::test_pretty_without_time("wuild-client-dispatch-tests")
                .with_env_overrides(),
        );
        Self
    }
}

#[test_dep]
fn tracing() -> Tracing {
    Tracing::init()
}

fn stub_response() -> ToolResponseFrame {
    ToolResponseFrame {
        result: true,
        stdout: "Stub output OK".to_string(),
        file_data: vec![],
        compression: CompressionKind::None,
        execution_time: Duration::from_millis(1),
    }
}

/// Channel double: reports active on start, records every dispatched tool
/// request, and replies from a per-channel script (stub success when the
/// script runs dry).
struct StubChannel {
    requests: Mutex<Vec<ToolRequestFrame>>,
    replies: Mutex<VecDeque<FrameReply>>,
    notifier: Mutex<Option<ChannelNotifier>>,
}

impl StubChannel {
    fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            replies: Mutex::new(VecDeque::new()),
            notifier: Mutex::new(None),
        }
    }

    fn script(&self, replies: impl IntoIterator<Item = FrameReply>) {
        self.replies.lock().unwrap().extend(replies);
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn requests(&self) -> Vec<ToolRequestFrame> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl FrameChannel for StubChannel {
    fn queue_frame(&self, _frame: Frame) {}

    fn queue_frame_with_reply(
        &self,
        frame: Frame,
        _timeout: Duration,
    ) -> oneshot::Receiver<FrameReply> {
        if let Frame::ToolRequest(request) = frame {
            self.requests.lock().unwrap().push(request);
        }
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| FrameReply::Success(Box::new(Frame::ToolResponse(stub_response()))));
        let (reply_tx, reply_rx) = oneshot::channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = reply_tx.send(reply);
        });
        reply_rx
    }

    fn set_notifier(&self, notifier: ChannelNotifier) {
        *self.notifier.lock().unwrap() = Some(notifier);
    }

    fn set_reader(&self, _reader: FrameReader) {}

    fn start(&self) {
        let notifier = self.notifier.lock().unwrap().clone();
        if let Some(notifier) = notifier {
            notifier(true);
        }
    }

    async fn stop(&self) {}
}

struct TestHarness {
    client: RemoteToolClient,
    channels: Arc<Mutex<HashMap<u16, Arc<StubChannel>>>>,
}

impl TestHarness {
    fn new(config: RemoteToolClientConfig) -> Self {
        let channels: Arc<Mutex<HashMap<u16, Arc<StubChannel>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let factory_channels = channels.clone();
        let factory: ChannelFactory =
            Arc::new(move |_host, port, _settings: ChannelSettings, _reconnect| {
                let channel = factory_channels
                    .lock()
                    .unwrap()
                    .entry(port)
                    .or_insert_with(|| Arc::new(StubChannel::new()))
                    .clone();
                channel as Arc<dyn FrameChannel>
            });
        let client = RemoteToolClient::with_transport(
            Arc::new(BasenameRewriter),
            Arc::new(LocalFileStore),
            factory,
        );
        assert!(client.set_config(config));
        Self { client, channels }
    }

    fn channel(&self, port: u16) -> Arc<StubChannel> {
        self.channels
            .lock()
            .unwrap()
            .entry(port)
            .or_insert_with(|| Arc::new(StubChannel::new()))
            .clone()
    }
}

fn test_config() -> RemoteToolClientConfig {
    RemoteToolClientConfig {
        client_id: "test-client".to_string(),
        coordinator: CoordinatorClientConfig {
            enabled: false,
            ..CoordinatorClientConfig::default()
        },
        queue_timeout: Duration::from_millis(300),
        request_timeout: Duration::from_millis(200),
        invocation_attempts: 1,
        dispatch_quant: Duration::from_millis(1),
        ..RemoteToolClientConfig::default()
    }
}

fn worker(worker_id: &str, port: u16, tools: &[&str], total_threads: u16) -> WorkerEndpoint {
    WorkerEndpoint {
        worker_id: worker_id.to_string(),
        host: "localhost".to_string(),
        port,
        tool_ids: tools.iter().map(|tool| ToolId::from(*tool)).collect(),
        total_threads,
        version_tag: 1,
        connected_sessions: vec![],
    }
}

fn capture() -> (InvokeCallback, Arc<Mutex<Vec<TaskExecutionInfo>>>) {
    let results: Arc<Mutex<Vec<TaskExecutionInfo>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = results.clone();
    let callback: InvokeCallback = Box::new(move |info| {
        sink.lock().unwrap().push(info);
    });
    (callback, results)
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[test]
async fn happy_path_returns_the_worker_output(_tracing: &Tracing) {
    let harness = TestHarness::new(test_config());
    harness.client.start(vec![]);
    harness.client.add_worker(&worker("w1", 9001, &["testTool"], 2), true);

    let (callback, results) = capture();
    harness
        .client
        .invoke_tool(ToolInvocation::new("testTool"), callback);

    eventually("task completion", || !results.lock().unwrap().is_empty()).await;
    {
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].result);
        assert_eq!(results[0].stdout, "Stub output OK");
    }

    eventually("capacity to return", || {
        harness.client.get_free_remote_threads() == 2
    })
    .await;
    assert!(harness.client.has_remote_capacity());
    harness.client.stop().await;
}

#[test]
async fn queue_timeout_without_fallback_fails_the_task_once(_tracing: &Tracing) {
    let harness = TestHarness::new(test_config());
    harness.client.start(vec![]);

    let (callback, results) = capture();
    harness
        .client
        .invoke_tool(ToolInvocation::new("testTool"), callback);

    eventually("expiration", || !results.lock().unwrap().is_empty()).await;
    // Let further quants run; the callback must not fire again.
    tokio::time::sleep(Duration::from_millis(200)).await;
    {
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].result);
        assert_eq!(results[0].stdout, "Timeout expired.");
    }
    harness.client.stop().await;
}

struct RecordingInvoker {
    invocations: Mutex<Vec<ToolInvocation>>,
}

impl LocalInvoker for RecordingInvoker {
    fn invoke_tool(&self, invocation: ToolInvocation, callback: InvokeCallback) {
        self.invocations.lock().unwrap().push(invocation);
        callback(TaskExecutionInfo {
            result: true,
            stdout: "local".to_string(),
            ..TaskExecutionInfo::default()
        });
    }
}

#[test]
async fn expiry_hands_the_original_invocation_to_the_fallback(_tracing: &Tracing) {
    let harness = TestHarness::new(test_config());
    let invoker = Arc::new(RecordingInvoker {
        invocations: Mutex::new(Vec::new()),
    });
    harness.client.set_invoker_fallback(invoker.clone());
    harness.client.start(vec![]);

    let (callback, results) = capture();
    let invocation = ToolInvocation::new("testTool")
        .with_args(vec!["-o".to_string(), "/out/dir/main.o".to_string()])
        .with_output("/out/dir/main.o");
    harness.client.invoke_tool(invocation, callback);

    eventually("fallback completion", || !results.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    {
        let invocations = invoker.invocations.lock().unwrap();
        assert_eq!(invocations.len(), 1);
        // The fallback sees the caller's paths, not the rewritten ones.
        assert_eq!(
            invocations[0].output_file,
            Some(PathBuf::from("/out/dir/main.o"))
        );
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].stdout, "local");
    }
    harness.client.stop().await;
}

#[test]
async fn transport_errors_are_retried_within_the_attempt_budget(_tracing: &Tracing) {
    let mut config = test_config();
    config.invocation_attempts = 2;
    let harness = TestHarness::new(config);

    let channel = harness.channel(9001);
    channel.script([FrameReply::Error("connection reset".to_string())]);

    harness.client.start(vec![]);
    harness.client.add_worker(&worker("w1", 9001, &["testTool"], 2), true);

    let (callback, results) = capture();
    harness
        .client
        .invoke_tool(ToolInvocation::new("testTool"), callback);

    eventually("retried completion", || !results.lock().unwrap().is_empty()).await;
    {
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].result);
    }
    assert_eq!(channel.request_count(), 2);
    assert_eq!(harness.client.session_info().tasks_count, 1);
    assert_eq!(harness.client.session_info().failures_count, 0);
    harness.client.stop().await;
}

#[test]
async fn the_attempt_budget_bounds_total_dispatches(_tracing: &Tracing) {
    let mut config = test_config();
    config.invocation_attempts = 2;
    let harness = TestHarness::new(config);

    let channel = harness.channel(9001);
    channel.script([
        FrameReply::Error("boom".to_string()),
        FrameReply::Error("boom again".to_string()),
        FrameReply::Error("never consumed".to_string()),
    ]);

    harness.client.start(vec![]);
    harness.client.add_worker(&worker("w1", 9001, &["testTool"], 2), true);

    let (callback, results) = capture();
    harness
        .client
        .invoke_tool(ToolInvocation::new("testTool"), callback);

    eventually("exhausted completion", || !results.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    {
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].result);
        assert!(results[0].stdout.contains("Internal error."));
    }
    assert_eq!(channel.request_count(), 2);
    assert_eq!(harness.client.session_info().failures_count, 1);
    harness.client.stop().await;
}

#[test]
async fn tasks_are_routed_to_the_worker_holding_the_tool(_tracing: &Tracing) {
    let harness = TestHarness::new(test_config());
    harness.client.start(vec![]);
    harness.client.add_worker(&worker("wa", 9001, &["toolA"], 2), true);
    harness.client.add_worker(&worker("wb", 9002, &["toolB"], 2), true);

    let (callback_a, results_a) = capture();
    let (callback_b, results_b) = capture();
    harness
        .client
        .invoke_tool(ToolInvocation::new("toolA"), callback_a);
    harness
        .client
        .invoke_tool(ToolInvocation::new("toolB"), callback_b);

    eventually("both completions", || {
        !results_a.lock().unwrap().is_empty() && !results_b.lock().unwrap().is_empty()
    })
    .await;

    let requests_a = harness.channel(9001).requests();
    let requests_b = harness.channel(9002).requests();
    assert_eq!(requests_a.len(), 1);
    assert_eq!(requests_a[0].invocation.tool_id, ToolId::from("toolA"));
    assert_eq!(requests_b.len(), 1);
    assert_eq!(requests_b[0].invocation.tool_id, ToolId::from("toolB"));
    harness.client.stop().await;
}

#[test]
async fn with_one_worker_thread_completions_follow_submission_order(_tracing: &Tracing) {
    let harness = TestHarness::new(test_config());
    harness.client.start(vec![]);
    harness.client.add_worker(&worker("w1", 9001, &["testTool"], 1), true);

    let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    for index in 0..3 {
        let order = order.clone();
        harness.client.invoke_tool(
            ToolInvocation::new("testTool"),
            Box::new(move |_info| {
                order.lock().unwrap().push(index);
            }),
        );
    }

    eventually("all completions", || order.lock().unwrap().len() == 3).await;
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    harness.client.stop().await;
}

#[test]
async fn remote_available_fires_exactly_once(_tracing: &Tracing) {
    let harness = TestHarness::new(test_config());
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_count = fired.clone();
    harness
        .client
        .set_remote_available_callback(Box::new(move || {
            fired_count.fetch_add(1, Ordering::SeqCst);
        }));

    harness.client.start(vec![]);
    harness.client.add_worker(&worker("w1", 9001, &["testTool"], 4), true);

    eventually("availability", || fired.load(Ordering::SeqCst) == 1).await;

    let mut refreshed = worker("w1", 9001, &["testTool"], 4);
    refreshed.version_tag = 2;
    harness.client.add_worker(&refreshed, true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(harness.channels.lock().unwrap().len(), 1);
    harness.client.stop().await;
}

#[test]
async fn session_accounting_matches_final_outcomes(_tracing: &Tracing) {
    let harness = TestHarness::new(test_config());
    let channel = harness.channel(9001);
    channel.script([FrameReply::Error("broken".to_string())]);

    harness.client.start(vec![]);
    harness.client.add_worker(&worker("w1", 9001, &["testTool"], 4), true);

    let completed = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let completed = completed.clone();
        harness.client.invoke_tool(
            ToolInvocation::new("testTool"),
            Box::new(move |_info| {
                completed.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }

    eventually("all completions", || completed.load(Ordering::SeqCst) == 3).await;
    let session = harness.client.session_info();
    assert_eq!(session.tasks_count, 3);
    assert_eq!(session.failures_count, 1);
    harness.client.stop().await;
}

#[test]
async fn unreadable_input_fails_immediately(_tracing: &Tracing) {
    let harness = TestHarness::new(test_config());
    harness.client.start(vec![]);

    let (callback, results) = capture();
    let invocation =
        ToolInvocation::new("testTool").with_input("/definitely/missing/input.c");
    harness.client.invoke_tool(invocation, callback);

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert!(!results[0].result);
    assert!(results[0].stdout.contains("failed to read"));
    drop(results);
    harness.client.stop().await;
}

#[test]
async fn required_tools_filter_the_roster(_tracing: &Tracing) {
    let harness = TestHarness::new(test_config());
    harness.client.start(vec![ToolId::from("toolA"), ToolId::from("toolB")]);

    // Advertises only one of the required tools, so it never joins.
    harness.client.add_worker(&worker("partial", 9001, &["toolA"], 4), true);
    assert!(harness.channels.lock().unwrap().is_empty());
    assert_eq!(harness.client.get_free_remote_threads(), 0);

    harness
        .client
        .add_worker(&worker("full", 9002, &["toolA", "toolB"], 4), true);
    eventually("full worker activation", || {
        harness.client.get_free_remote_threads() == 4
    })
    .await;
    harness.client.stop().await;
}
