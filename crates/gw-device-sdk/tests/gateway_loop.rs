//! Integration test: boots an in-process WebSocket server that simulates
//! the gateway side of the device protocol, connects a real
//! [`DeviceClient`] over TCP, and asserts the full handshake +
//! subscribe/publish/dispatch cycle.
//!
//! This single test covers the wire-level regressions the scripted-mock
//! suite can't: real framing, the auth envelope shape on the socket,
//! Subscribe frames arriving before the publish they gate, and a clean
//! Closing → Closed shutdown.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use gw_device_sdk::protocol::{self, Envelope, MessageType};
use gw_device_sdk::{ConnectionState, DeviceClient, DeviceConfig};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

const GOOD_TOKEN: &str = "secret";

/// Boots a tiny gateway on an ephemeral port. Each connection gets the
/// full treatment: auth handshake, subscription tracking, loopback of
/// matching publishes as Message frames, pong replies.
async fn start_mini_gateway() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _peer)) = listener.accept().await {
            tokio::spawn(async move {
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let (mut sink, mut stream) = ws.split();
                let mut subscriptions: Vec<String> = Vec::new();
                let mut authed = false;

                while let Some(Ok(msg)) = stream.next().await {
                    let Message::Text(text) = msg else {
                        if matches!(msg, Message::Close(_)) {
                            break;
                        }
                        continue;
                    };
                    let Ok(envelope) = protocol::decode(&text) else {
                        continue;
                    };

                    match envelope.msg_type {
                        MessageType::Auth => {
                            let token = envelope
                                .payload
                                .as_ref()
                                .and_then(|p| p.get("token"))
                                .and_then(|t| t.as_str())
                                .unwrap_or("");
                            let reply = if token == GOOD_TOKEN {
                                authed = true;
                                json!({
                                    "success": true,
                                    "device": {
                                        "deviceId": "sensor-7",
                                        "deviceType": "sensor",
                                        "allowedPublishTopics": ["echo.>", "telemetry.>"],
                                        "allowedSubscribeTopics": ["echo.>"]
                                    }
                                })
                            } else {
                                json!({"success": false, "message": "invalid token"})
                            };
                            let frame = Envelope {
                                msg_type: MessageType::Auth,
                                payload: Some(reply),
                                ..Envelope::ping()
                            };
                            let text = protocol::encode(&frame).unwrap();
                            if sink.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        MessageType::Subscribe => {
                            if let Some(pattern) = envelope.subject {
                                subscriptions.push(pattern);
                            }
                        }
                        MessageType::Unsubscribe => {
                            if let Some(pattern) = envelope.subject {
                                subscriptions.retain(|p| p != &pattern);
                            }
                        }
                        MessageType::Publish => {
                            // Loop matching publishes back as Messages,
                            // the way the bus would for a self-subscriber.
                            if !authed {
                                continue;
                            }
                            let Some(subject) = envelope.subject else {
                                continue;
                            };
                            if subscriptions
                                .iter()
                                .any(|p| protocol::matches(p, &subject))
                            {
                                let frame = Envelope {
                                    msg_type: MessageType::Message,
                                    device_id: Some("sensor-7".into()),
                                    ..Envelope::publish(
                                        subject,
                                        envelope.payload.unwrap_or(serde_json::Value::Null),
                                    )
                                };
                                let text = protocol::encode(&frame).unwrap();
                                if sink.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        MessageType::Ping => {
                            let text = protocol::encode(&Envelope::pong()).unwrap();
                            if sink.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
            });
        }
    });

    addr
}

fn config(addr: SocketAddr, token: &str) -> DeviceConfig {
    DeviceConfig::builder()
        .gateway_url(format!("ws://{addr}/ws"))
        .device_id("sensor-7")
        .auth_token(token)
        .connect_timeout(Duration::from_secs(5))
        .auth_timeout(Duration::from_secs(5))
        .disable_reconnect()
        .build()
        .unwrap()
}

#[tokio::test]
async fn full_loop_over_real_websocket() {
    let addr = start_mini_gateway().await;
    let mut client = DeviceClient::new(config(addr, GOOD_TOKEN)).unwrap();

    assert!(client.run_async(), "engine moves to background");
    assert!(client.connect().await, "connect + auth against the gateway");
    assert_eq!(client.state(), ConnectionState::Connected);

    let info = client.device_info().expect("granted identity");
    assert_eq!(info.device_id, "sensor-7");
    assert!(info.allows_publish("echo.hello"));

    // Subscribe, then publish into the subscription; the gateway loops
    // the frame back and the handler must see it.
    let (delivered_tx, mut delivered_rx) = mpsc::unbounded_channel();
    let handle = client.handle();
    handle
        .subscribe("echo.>", move |subject, payload, envelope| {
            let _ = delivered_tx.send((
                subject.to_string(),
                payload.clone(),
                envelope.device_id.clone(),
            ));
        })
        .unwrap();

    handle.publish("echo.hello", json!({"n": 1})).unwrap();

    let (subject, payload, device_id) =
        tokio::time::timeout(Duration::from_secs(5), delivered_rx.recv())
            .await
            .expect("loopback within deadline")
            .expect("handler invoked");
    assert_eq!(subject, "echo.hello");
    assert_eq!(payload, json!({"n": 1}));
    assert_eq!(device_id.as_deref(), Some("sensor-7"));

    let stats = client.stats();
    assert!(stats.messages_sent >= 3, "auth + subscribe + publish");
    assert!(stats.messages_received >= 2, "auth reply + loopback");
    assert!(stats.bytes_sent > 0 && stats.bytes_received > 0);

    // Clean shutdown: Closing → Closed, no reconnect.
    handle.disconnect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
    client.stop().await;
}

#[tokio::test]
async fn gateway_rejecting_token_fails_the_connect() {
    let addr = start_mini_gateway().await;
    let mut client = DeviceClient::new(config(addr, "wrong-token")).unwrap();

    assert!(!client.connect().await);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.device_info().is_none());
}
