//! # Status WebSocket
//!
//! Clients subscribe to `evaluation.status` per evaluation and receive every
//! status event pushed by the broadcaster. Protocol:
//!
//! ```text
//! → {"type":"ping"}                                       ← {"type":"pong"}
//! → {"action":"subscribe","channel":"evaluation.status","evaluation_id":7}
//! ← {"type":"subscribed","channel":"evaluation.status","evaluation_id":7}
//! ← {"type":"status","channel":"evaluation.status","evaluationId":7,"status":"READY",...}
//! ```

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use proctor_core::orchestration::{ChannelSink, EventSink, CHANNEL_EVALUATION_STATUS};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use tokio_stream::wrappers::ReceiverStream;

use super::AppState;

const INVALID_REQUEST: &str = "invalid_request";

#[derive(Debug, PartialEq)]
enum ClientRequest {
    Ping,
    Subscribe(i64),
    Unsubscribe(i64),
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Reply {
    Pong,
    Subscribed {
        channel: &'static str,
        evaluation_id: i64,
    },
    Unsubscribed {
        channel: &'static str,
        evaluation_id: i64,
    },
    Error {
        code: &'static str,
        message: &'static str,
    },
}

impl Reply {
    fn invalid(message: &'static str) -> Self {
        Reply::Error {
            code: INVALID_REQUEST,
            message,
        }
    }
}

fn parse_request(raw: &str) -> Result<ClientRequest, &'static str> {
    let Ok(Value::Object(message)) = serde_json::from_str::<Value>(raw) else {
        return Err("Message must be a JSON object.");
    };

    if message.get("type").and_then(Value::as_str) == Some("ping") {
        return Ok(ClientRequest::Ping);
    }

    let action = message.get("action").and_then(Value::as_str);
    if !matches!(action, Some("subscribe") | Some("unsubscribe")) {
        return Err("Unsupported action; expected subscribe or unsubscribe.");
    }

    if message.get("channel").and_then(Value::as_str) != Some(CHANNEL_EVALUATION_STATUS) {
        return Err("Unsupported channel.");
    }

    let raw_id = message
        .get("evaluation_id")
        .or_else(|| message.get("evaluationId"));
    let Some(evaluation_id) = raw_id.and_then(parse_evaluation_id) else {
        return Err("evaluation_id must be an integer.");
    };

    Ok(match action {
        Some("subscribe") => ClientRequest::Subscribe(evaluation_id),
        _ => ClientRequest::Unsubscribe(evaluation_id),
    })
}

/// Integers and digit strings; booleans and fractions are rejected
fn parse_evaluation_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub async fn status_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_status_socket(socket, state))
}

async fn handle_status_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (sink, rx) = ChannelSink::new(state.config.subscriber_buffer);
    let sink_id = sink.id();
    let mut events = ReceiverStream::new(rx);
    let mut subscriptions: HashSet<i64> = HashSet::new();

    tracing::debug!("WebSocket {} connected", sink_id);

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                tracing::debug!("WebSocket {} received: {}", sink_id, text);

                let reply = match parse_request(&text) {
                    Ok(ClientRequest::Ping) => Reply::Pong,
                    Ok(ClientRequest::Subscribe(evaluation_id)) => {
                        state.orchestrator.subscribe(sink.clone(), evaluation_id).await;
                        subscriptions.insert(evaluation_id);
                        Reply::Subscribed {
                            channel: CHANNEL_EVALUATION_STATUS,
                            evaluation_id,
                        }
                    }
                    Ok(ClientRequest::Unsubscribe(evaluation_id)) => {
                        state.orchestrator.unsubscribe(sink_id, evaluation_id).await;
                        subscriptions.remove(&evaluation_id);
                        Reply::Unsubscribed {
                            channel: CHANNEL_EVALUATION_STATUS,
                            evaluation_id,
                        }
                    }
                    Err(message) => Reply::invalid(message),
                };

                if send_json(&mut sender, &reply).await.is_err() {
                    break;
                }
            }
            event = events.next() => {
                let Some(event) = event else { break };
                if send_json(&mut sender, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    for evaluation_id in subscriptions {
        state.orchestrator.unsubscribe(sink_id, evaluation_id).await;
    }
    state.orchestrator.remove(sink_id).await;
    tracing::debug!("WebSocket {} disconnected", sink_id);
}

async fn send_json<S, T>(sender: &mut S, payload: &T) -> Result<(), axum::Error>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
    T: Serialize,
{
    let text = match serde_json::to_string(payload) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("Dropping unserializable WebSocket payload: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text)).await
}
