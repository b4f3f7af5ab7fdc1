/// End-to-end tests against the tether-echo child process
mod common;

use common::{echo_endpoint, fast_options, wait_for_state};
use serde_json::json;
use std::time::Duration;
use tether_core::mcp::error::McpError;
use tether_core::mcp::types::methods;
use tether_core::mcp::{Connection, ConnectionEvent, ConnectionState};

#[tokio::test]
async fn test_connect_discovers_tools_and_calls_them() {
    let conn = Connection::new(
        echo_endpoint("echo-a").with_env("TETHER_ECHO_TOOLS", "echo,shout"),
        fast_options(),
    );
    conn.connect().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);

    let snapshot = conn.snapshot();
    assert_eq!(snapshot.server_info.as_ref().unwrap().name, "echo-a");
    assert!(snapshot.has_tool("echo"));
    assert!(snapshot.has_tool("shout"));
    assert!(snapshot.has_tool("whoami"));

    let result = conn
        .call_tool("echo", Some(json!({"text": "hello"})))
        .await
        .unwrap();
    assert!(!result.is_error);
    assert_eq!(result.joined_text(), "hello");

    // a tool-level failure is a successful call carrying isError
    let failed = conn.call_tool("fail", None).await.unwrap();
    assert!(failed.is_error);
    assert!(failed.joined_text().contains("requested failure"));

    conn.ping().await.unwrap();
    conn.disconnect().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_unknown_tool_is_rejected_locally() {
    let conn = Connection::new(echo_endpoint("echo-b"), fast_options());
    conn.connect().await.unwrap();

    let err = conn.call_tool("does-not-exist", None).await.unwrap_err();
    assert!(matches!(err, McpError::ToolNotFound(name) if name == "does-not-exist"));

    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_call_before_connect_is_not_connected() {
    let conn = Connection::new(echo_endpoint("echo-idle"), fast_options());
    let err = conn.call_tool("echo", None).await.unwrap_err();
    assert!(matches!(err, McpError::NotConnected(_)));
}

#[tokio::test]
async fn test_disconnect_rejects_in_flight_requests() {
    let conn = Connection::new(echo_endpoint("echo-c"), fast_options());
    conn.connect().await.unwrap();

    let caller = conn.clone();
    let in_flight = tokio::spawn(async move {
        caller
            .send_request(
                methods::TOOLS_CALL,
                Some(json!({"name": "slow", "arguments": {"ms": 3000}})),
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    conn.disconnect().await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), in_flight)
        .await
        .expect("pending request was not released")
        .unwrap();
    assert!(matches!(outcome, Err(McpError::TransportDisconnected)));
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_concurrent_calls_are_matched_by_id() {
    let conn = Connection::new(echo_endpoint("echo-d"), fast_options());
    conn.connect().await.unwrap();

    // the slow call is answered after the fast ones
    let slow = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.call_tool("slow", Some(json!({"ms": 300}))).await })
    };
    let mut fast = Vec::new();
    for i in 0..5 {
        let conn = conn.clone();
        fast.push(tokio::spawn(async move {
            conn.call_tool("echo", Some(json!({"text": format!("n{i}")}))).await
        }));
    }

    for (i, handle) in fast.into_iter().enumerate() {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.joined_text(), format!("n{i}"));
    }
    assert_eq!(slow.await.unwrap().unwrap().joined_text(), "slept 300ms");

    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_crash_triggers_reconnect() {
    let conn = Connection::new(echo_endpoint("echo-e"), fast_options());
    let mut events = conn.subscribe();
    conn.connect().await.unwrap();

    // the crashing call itself is rejected when the process goes away
    let err = conn.call_tool("crash", None).await.unwrap_err();
    assert!(matches!(err, McpError::ToolCall { .. }));

    wait_for_state(&conn, ConnectionState::Connected, Duration::from_secs(10)).await;

    // initial connecting/connected, then the drop and the way back
    let mut seen = Vec::new();
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
        if let ConnectionEvent::StateChanged { state, .. } = event {
            seen.push(state);
            if seen.len() >= 5 {
                break;
            }
        }
    }
    assert_eq!(
        seen,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
    assert_eq!(conn.reconnect_attempts(), 0);

    let result = conn.call_tool("echo", Some(json!({"text": "back"}))).await.unwrap();
    assert_eq!(result.joined_text(), "back");
    conn.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_missing_binary_settles_in_error() {
    let config = tether_core::EndpointConfig::stdio("ghost", "/nonexistent/tether-server");
    let conn = Connection::new(config, fast_options());

    assert!(conn.connect().await.is_err());
    assert_eq!(conn.state(), ConnectionState::Error);
    assert!(conn.last_error().is_some());

    // a failed caller-initiated connect does not retry on its own
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(conn.state(), ConnectionState::Error);
}
