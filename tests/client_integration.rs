//! End-to-end tests of the client against a scripted fake server.
//!
//! The fake server sits on the other end of an in-memory duplex stream
//! and reads/writes line-delimited JSON exactly as the real server does.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::io::{duplex, split, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use url::Url;

use analysis_client::client::{ReverseCallRegistry, ShowMessageRequest};
use analysis_client::protocol::methods::{
    FileOffsetParams, FileParams, GetErrors, GetHover, GetVersion,
};
use analysis_client::protocol::{NoParams, RequestError};
use analysis_client::transport::{read_message, write_message, FramingError};
use analysis_client::{
    AnalysisClient, AnalysisEvent, ClientConfig, ClientError, ClientState, ConnectionState,
    Endpoint, ErrorKind, Framing, Health, StatusEvent, Transport,
};

/// Test timeout to prevent hanging tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct FakeServer {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeServer {
    async fn send(&mut self, message: Value) {
        write_message(&mut self.writer, &message.to_string(), Framing::LineDelimited)
            .await
            .expect("Server write failed");
    }

    async fn recv(&mut self) -> Value {
        let text = timeout(TEST_TIMEOUT, read_message(&mut self.reader, Framing::LineDelimited))
            .await
            .expect("Timed out waiting for client message")
            .expect("Server read failed");
        serde_json::from_str(&text).expect("Client sent invalid JSON")
    }

    /// Read until EOF; returns whether the client closed its side.
    async fn sees_eof(&mut self) -> bool {
        loop {
            match timeout(TEST_TIMEOUT, read_message(&mut self.reader, Framing::LineDelimited))
                .await
                .expect("Timed out waiting for EOF")
            {
                Ok(_) => continue,
                Err(FramingError::Closed) => return true,
                Err(_) => return false,
            }
        }
    }

    async fn expect_request(&mut self, method: &str) -> Value {
        let request = self.recv().await;
        assert_eq!(request["method"], method, "unexpected request {}", request);
        request
    }

    async fn reply(&mut self, request: &Value, result: Value) {
        self.send(json!({ "id": request["id"], "result": result })).await;
    }

    async fn announce(&mut self) {
        self.send(json!({
            "event": "server.connected",
            "params": { "version": "3.5.0", "pid": 4321 }
        }))
        .await;
    }
}

fn pair() -> (Transport, FakeServer) {
    let (client_io, server_io) = duplex(64 * 1024);
    let (client_read, client_write) = split(client_io);
    let (server_read, server_write) = split(server_io);
    (
        Transport::from_stream(client_read, client_write, Framing::LineDelimited),
        FakeServer {
            reader: BufReader::new(server_read),
            writer: server_write,
        },
    )
}

async fn started(client: &AnalysisClient) -> FakeServer {
    let (transport, mut server) = pair();
    server.announce().await;
    let info = timeout(TEST_TIMEOUT, client.start_with_transport(transport))
        .await
        .expect("Start timed out")
        .expect("Start failed");
    assert_eq!(info.version, "3.5.0");
    assert_eq!(info.pid, 4321);
    server
}

fn status_channel(client: &AnalysisClient) -> mpsc::UnboundedReceiver<StatusEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.add_status_listener(Arc::new(move |status: &StatusEvent| -> anyhow::Result<()> {
        let _ = tx.send(status.clone());
        Ok(())
    }));
    rx
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(TEST_TIMEOUT, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Condition never became true");
}

#[tokio::test]
async fn test_start_completes_handshake() {
    let client = AnalysisClient::new(ClientConfig::default());
    assert_eq!(client.state(), ClientState::NotStarted);
    assert!(!client.is_socket_open());

    let _server = started(&client).await;

    assert_eq!(client.state(), ClientState::Running);
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert_eq!(client.health(), Health::Healthy);
    assert!(client.is_socket_open());
    assert_eq!(client.server_info().map(|s| s.version), Some("3.5.0".to_string()));

    // A second start is refused
    let (transport, _other) = pair();
    let err = client.start_with_transport(transport).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() {
    let client = AnalysisClient::new(ClientConfig::default());
    let mut server = started(&client).await;

    let version = client.send::<GetVersion>(NoParams).expect("send failed");
    let errors = client
        .send::<GetErrors>(FileParams::new("/work/lib/main.dart"))
        .expect("send failed");
    assert_ne!(version.id(), errors.id());
    assert_eq!(client.pending_count(), 2);

    let first = server.expect_request("server.getVersion").await;
    let second = server.expect_request("analysis.getErrors").await;
    assert_eq!(second["params"]["file"], "/work/lib/main.dart");

    server.reply(&second, json!({ "errors": [] })).await;
    server.reply(&first, json!({ "version": "3.5.0" })).await;

    let errors = timeout(TEST_TIMEOUT, errors.wait()).await.expect("timed out").unwrap();
    let version = timeout(TEST_TIMEOUT, version.wait()).await.expect("timed out").unwrap();
    assert!(errors.errors.is_empty());
    assert_eq!(version.version, "3.5.0");
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_transport_closure_fails_every_outstanding_call() {
    let client = AnalysisClient::new(ClientConfig::default());
    let mut statuses = status_channel(&client);
    let mut server = started(&client).await;

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.call::<GetVersion>(NoParams).await })
        })
        .collect();

    for _ in 0..3 {
        server.expect_request("server.getVersion").await;
    }
    drop(server);

    for call in calls {
        let result = timeout(TEST_TIMEOUT, call)
            .await
            .expect("Call never completed")
            .expect("Task panicked");
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport, "{:?}", err);
    }

    timeout(TEST_TIMEOUT, client.stopped()).await.expect("Client never stopped");
    assert_eq!(client.pending_count(), 0);
    assert_eq!(client.connection_state(), ConnectionState::Closed);
    assert!(!client.is_socket_open());

    let mut lost = false;
    while let Ok(status) = statuses.try_recv() {
        lost |= matches!(status, StatusEvent::TransportLost { .. });
    }
    assert!(lost, "status listeners were not told about the transport loss");

    // Nothing new can be issued
    let err = client.send::<GetVersion>(NoParams).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_unknown_server_request_is_answered_and_dispatch_continues() {
    let client = AnalysisClient::new(ClientConfig::default());
    let mut server = started(&client).await;

    server
        .send(json!({ "id": "s1", "method": "server.fooRequest", "params": {} }))
        .await;
    let reply = server.recv().await;
    assert_eq!(reply["id"], "s1");
    assert_eq!(reply["error"]["code"], "UNKNOWN_REQUEST");
    assert!(reply.get("result").is_none());

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call::<GetVersion>(NoParams).await })
    };
    let request = server.expect_request("server.getVersion").await;
    server.reply(&request, json!({ "version": "3.5.0" })).await;

    let version = timeout(TEST_TIMEOUT, call).await.expect("timed out").unwrap();
    assert_eq!(version.unwrap().version, "3.5.0");
}

#[tokio::test]
async fn test_negotiated_reverse_calls() {
    let opened = Arc::new(Mutex::new(Vec::new()));
    let sink = opened.clone();

    let mut reverse = ReverseCallRegistry::new();
    reverse
        .on_open_url(move |url: Url| {
            sink.lock().unwrap().push(url.to_string());
            async { Ok::<_, RequestError>(()) }
        })
        .unwrap();
    reverse
        .on_show_message(|request: ShowMessageRequest| async move {
            Ok::<_, RequestError>(request.actions.last().map(|a| a.label.clone()))
        })
        .unwrap();

    let client = AnalysisClient::builder(ClientConfig::default())
        .reverse_calls(reverse)
        .build();
    let (transport, mut server) = pair();

    let (outcome, ()) = tokio::join!(client.start_with_transport(transport), async {
        server.announce().await;
        let request = server.expect_request("server.setClientCapabilities").await;
        assert_eq!(
            request["params"]["requests"],
            json!(["openUrlRequest", "showMessageRequest"])
        );
        server.reply(&request, Value::Null).await;
    });
    outcome.expect("Start failed");

    server
        .send(json!({
            "id": "s1",
            "method": "server.openUrlRequest",
            "params": { "url": "https://dart.dev/tools/linter-rules" }
        }))
        .await;
    let reply = server.recv().await;
    assert_eq!(reply, json!({ "id": "s1" }));
    assert_eq!(
        *opened.lock().unwrap(),
        vec!["https://dart.dev/tools/linter-rules"]
    );

    server
        .send(json!({
            "id": "s2",
            "method": "server.showMessageRequest",
            "params": {
                "type": "INFO",
                "message": "Restart analysis?",
                "actions": [{ "label": "No" }, { "label": "Yes" }]
            }
        }))
        .await;
    let reply = server.recv().await;
    assert_eq!(reply, json!({ "id": "s2", "result": { "action": "Yes" } }));
}

#[tokio::test]
async fn test_invalid_params_never_reach_the_transport() {
    let client = AnalysisClient::new(ClientConfig::default());
    let sent = Arc::new(Mutex::new(Vec::new()));
    let log = sent.clone();
    client.add_request_listener(Arc::new(move |raw: &str| -> anyhow::Result<()> {
        log.lock().unwrap().push(raw.to_string());
        Ok(())
    }));
    let _server = started(&client).await;

    for bad in ["", "lib/main.dart", "/work/../main.dart"] {
        let err = client
            .call::<GetErrors>(FileParams::new(bad))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LocalValidation, "{:?}", bad);
    }

    assert_eq!(client.pending_count(), 0);
    assert!(sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_then_late_response_is_dropped() {
    let client = AnalysisClient::new(ClientConfig::default());
    let mut server = started(&client).await;

    let hover = client
        .send::<GetHover>(FileOffsetParams {
            file: "/work/lib/main.dart".into(),
            offset: 42,
        })
        .expect("send failed");
    let id = hover.id().clone();

    assert!(client.cancel(&id));
    assert!(!client.cancel(&id));
    let err = hover.wait().await.unwrap_err();
    assert_eq!(err, ClientError::Cancelled { id: id.clone() });
    // Neither the cancelled call nor the cancel request stays tracked
    assert_eq!(client.pending_count(), 0);

    let original = server.expect_request("analysis.getHover").await;
    let cancel = server.expect_request("server.cancelRequest").await;
    assert_eq!(cancel["params"]["id"], id.as_str());
    server.reply(&cancel, Value::Null).await;

    // The late reply must not land anywhere
    server.reply(&original, json!({ "hovers": [] })).await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call::<GetVersion>(NoParams).await })
    };
    let request = server.expect_request("server.getVersion").await;
    assert_ne!(request["id"], original["id"]);
    server.reply(&request, json!({ "version": "9.9.9" })).await;

    let version = timeout(TEST_TIMEOUT, call).await.expect("timed out").unwrap();
    assert_eq!(version.unwrap().version, "9.9.9");
}

#[tokio::test]
async fn test_abandoned_calls_leave_no_entries() {
    let client = AnalysisClient::new(ClientConfig::default());
    let mut server = started(&client).await;

    drop(client.send::<GetVersion>(NoParams).expect("send failed"));
    assert_eq!(client.pending_count(), 0);

    tokio::select! {
        _ = client.call::<GetErrors>(FileParams::new("/work/lib/a.dart")) => {
            panic!("silent server answered")
        }
        _ = sleep(Duration::from_millis(20)) => {}
    }
    assert_eq!(client.pending_count(), 0);
    assert!(client.pending_calls().is_empty());

    // Both requests did go out; their late replies are discarded
    let version = server.expect_request("server.getVersion").await;
    let errors = server.expect_request("analysis.getErrors").await;
    server.reply(&version, json!({ "version": "3.5.0" })).await;
    server.reply(&errors, json!({ "errors": [] })).await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call::<GetVersion>(NoParams).await })
    };
    let request = server.expect_request("server.getVersion").await;
    server.reply(&request, json!({ "version": "4.0.0" })).await;
    let version = timeout(TEST_TIMEOUT, call).await.expect("timed out").unwrap();
    assert_eq!(version.unwrap().version, "4.0.0");
    assert_eq!(client.state(), ClientState::Running);
}

#[tokio::test]
async fn test_result_shape_mismatch_is_protocol_violation() {
    let client = AnalysisClient::new(ClientConfig::default());
    let mut server = started(&client).await;

    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.call::<GetVersion>(NoParams).await })
    };
    let request = server.expect_request("server.getVersion").await;
    server.reply(&request, json!({ "version": 3 })).await;

    let err = timeout(TEST_TIMEOUT, call)
        .await
        .expect("timed out")
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    assert_eq!(client.state(), ClientState::Running);
}

#[tokio::test]
async fn test_remote_error_reaches_only_its_caller() {
    let client = AnalysisClient::new(ClientConfig::default());
    let mut server = started(&client).await;

    let failing = client
        .send::<GetErrors>(FileParams::new("/outside/root.dart"))
        .expect("send failed");
    let healthy = client.send::<GetVersion>(NoParams).expect("send failed");

    let errors_request = server.expect_request("analysis.getErrors").await;
    let version_request = server.expect_request("server.getVersion").await;
    server
        .send(json!({
            "id": errors_request["id"],
            "error": { "code": "GET_ERRORS_INVALID_FILE", "message": "File is not analyzed" }
        }))
        .await;
    server.reply(&version_request, json!({ "version": "3.5.0" })).await;

    match failing.wait().await.unwrap_err() {
        ClientError::Remote { code, message, .. } => {
            assert_eq!(code, "GET_ERRORS_INVALID_FILE");
            assert_eq!(message, "File is not analyzed");
        }
        other => panic!("Expected Remote, got {:?}", other),
    }
    assert_eq!(healthy.wait().await.unwrap().version, "3.5.0");
}

#[tokio::test]
async fn test_failing_listener_does_not_stop_delivery() {
    let client = AnalysisClient::new(ClientConfig::default());
    let mut diagnostics = client.subscribe_diagnostics();
    let (tx, mut events) = mpsc::unbounded_channel();

    client.add_analysis_listener(Arc::new(|_: &AnalysisEvent| -> anyhow::Result<()> {
        anyhow::bail!("listener is broken")
    }));
    client.add_analysis_listener(Arc::new(move |event: &AnalysisEvent| -> anyhow::Result<()> {
        let _ = tx.send(event.clone());
        Ok(())
    }));

    let mut server = started(&client).await;
    // The handshake itself was delivered to analysis listeners
    let first = timeout(TEST_TIMEOUT, events.recv()).await.expect("timed out").unwrap();
    assert_eq!(first.name(), "server.connected");

    server
        .send(json!({
            "event": "analysis.errors",
            "params": { "file": "/work/lib/main.dart", "errors": [] }
        }))
        .await;

    let event = timeout(TEST_TIMEOUT, events.recv()).await.expect("timed out").unwrap();
    assert_eq!(
        event,
        AnalysisEvent::Errors {
            file: "/work/lib/main.dart".into(),
            errors: vec![],
        }
    );

    let failure = timeout(TEST_TIMEOUT, diagnostics.recv())
        .await
        .expect("timed out")
        .expect("diagnostics closed");
    assert_eq!(failure.message, "listener is broken");
}

#[tokio::test]
async fn test_trace_listeners_see_raw_traffic() {
    let client = AnalysisClient::new(ClientConfig::default());
    let outbound = Arc::new(Mutex::new(Vec::new()));
    let inbound = Arc::new(Mutex::new(Vec::new()));
    let out_log = outbound.clone();
    let in_log = inbound.clone();
    client.add_request_listener(Arc::new(move |raw: &str| -> anyhow::Result<()> {
        out_log.lock().unwrap().push(raw.to_string());
        Ok(())
    }));
    client.add_response_listener(Arc::new(move |raw: &str| -> anyhow::Result<()> {
        in_log.lock().unwrap().push(raw.to_string());
        Ok(())
    }));

    let mut server = started(&client).await;
    let call = client.send::<GetVersion>(NoParams).expect("send failed");
    let request = server.expect_request("server.getVersion").await;
    server.reply(&request, json!({ "version": "3.5.0" })).await;
    call.wait().await.unwrap();

    let outbound = outbound.lock().unwrap().clone();
    assert_eq!(outbound.len(), 1);
    assert_eq!(serde_json::from_str::<Value>(&outbound[0]).unwrap(), request);

    let inbound = inbound.lock().unwrap().clone();
    assert_eq!(inbound.len(), 2);
    assert!(inbound[0].contains("server.connected"));
    assert!(inbound[1].contains("3.5.0"));
}

#[tokio::test]
async fn test_garbage_is_reported_and_skipped() {
    let client = AnalysisClient::new(ClientConfig::default());
    let mut statuses = status_channel(&client);
    let mut server = started(&client).await;

    write_message(&mut server.writer, "{not json", Framing::LineDelimited)
        .await
        .unwrap();

    let anomaly = timeout(TEST_TIMEOUT, async {
        loop {
            match statuses.recv().await {
                Some(StatusEvent::ProtocolAnomaly { detail }) => return detail,
                Some(_) => continue,
                None => panic!("status channel closed"),
            }
        }
    })
    .await
    .expect("No anomaly reported");
    assert!(anomaly.contains("Undecodable"), "{}", anomaly);
    assert_eq!(client.state(), ClientState::Running);
}

#[tokio::test]
async fn test_shutdown_closes_and_drains() {
    let client = AnalysisClient::new(ClientConfig::default());
    let mut server = started(&client).await;

    let outstanding = client
        .send::<GetErrors>(FileParams::new("/work/lib/a.dart"))
        .expect("send failed");
    server.expect_request("analysis.getErrors").await;

    let (result, ()) = tokio::join!(client.shutdown(), async {
        let request = server.expect_request("server.shutdown").await;
        server.reply(&request, Value::Null).await;
    });
    result.expect("shutdown failed");

    assert_eq!(client.state(), ClientState::Stopped);
    assert_eq!(client.connection_state(), ConnectionState::Closed);
    assert!(!client.is_socket_open());
    assert_eq!(client.pending_count(), 0);
    assert_eq!(outstanding.wait().await.unwrap_err().kind(), ErrorKind::Transport);
    assert!(server.sees_eof().await);

    // Idempotent, and nothing can be sent afterwards
    client.shutdown().await.expect("second shutdown failed");
    let err = client.send::<GetVersion>(NoParams).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_shutdown_is_unilateral_when_server_is_silent() {
    let mut config = ClientConfig::default();
    config.shutdown_timeout = Duration::from_millis(50);
    let client = AnalysisClient::new(config);
    let mut server = started(&client).await;

    timeout(TEST_TIMEOUT, client.shutdown())
        .await
        .expect("shutdown hung")
        .expect("shutdown failed");

    assert_eq!(client.state(), ClientState::Stopped);
    server.expect_request("server.shutdown").await;
    assert!(server.sees_eof().await);
}

#[tokio::test]
async fn test_startup_failure_leaves_client_stopped() {
    let client = AnalysisClient::new(ClientConfig::default());
    let endpoint = Endpoint::UnixSocket(PathBuf::from("/nonexistent/analysis-client-test.sock"));

    let err = client.start(&endpoint).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Startup);
    assert_eq!(client.state(), ClientState::Stopped);
    assert!(!client.is_socket_open());
    client.shutdown().await.expect("shutdown after failed start");
}

#[tokio::test]
async fn test_missing_handshake_times_out() {
    let config = ClientConfig::default().with_startup_timeout(Duration::from_millis(50));
    let client = AnalysisClient::new(config);
    let (transport, mut server) = pair();

    let err = timeout(TEST_TIMEOUT, client.start_with_transport(transport))
        .await
        .expect("start hung")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Startup);
    assert_eq!(client.state(), ClientState::Stopped);
    assert!(server.sees_eof().await);
}

#[tokio::test]
async fn test_unanswered_ping_marks_server_unresponsive() {
    let config = ClientConfig::default().with_ping_interval(Some(Duration::from_millis(100)));
    let config = ClientConfig {
        ping_timeout: Duration::from_millis(30),
        ..config
    };
    let client = AnalysisClient::new(config);
    let mut server = started(&client).await;

    // Never answer the ping
    server.expect_request("server.getVersion").await;
    wait_until(|| client.health() == Health::Unresponsive).await;

    // Any traffic proves the server is alive again
    server
        .send(json!({ "event": "server.status", "params": { "analysis": { "isAnalyzing": false } } }))
        .await;
    wait_until(|| client.health() == Health::Healthy).await;
    assert_eq!(client.state(), ClientState::Running);
}

#[tokio::test]
async fn test_pending_calls_snapshot() {
    let client = AnalysisClient::new(ClientConfig::default());
    let mut server = started(&client).await;

    let _errors = client
        .send::<GetErrors>(FileParams::new("/work/lib/a.dart"))
        .expect("send failed");
    let _version = client.send::<GetVersion>(NoParams).expect("send failed");

    let methods: Vec<String> = client
        .pending_calls()
        .into_iter()
        .map(|call| call.method)
        .collect();
    assert_eq!(methods, vec!["analysis.getErrors", "server.getVersion"]);

    server.expect_request("analysis.getErrors").await;
}
