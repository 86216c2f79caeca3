use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Instant, interval};

use quill_protocol::{CloseCode, OP_ACK, OP_QUEUE_TASK, ServerMessage};

use crate::autopilot::Scheduler;
use crate::ratelimit::Role;
use crate::registry::{AuthCtx, Outbound};
use crate::web::AppState;

/// Per-connection knobs, taken from config at upgrade time.
#[derive(Debug, Clone, Copy)]
pub struct WsSettings {
    pub heartbeat: Duration,
    pub message_limit: usize,
    pub message_interval: Duration,
}

/// Sliding-window limiter for inbound frames on one connection.
struct MessageLimiter {
    limit: usize,
    interval: Duration,
    hits: Vec<Instant>,
}

impl MessageLimiter {
    fn new(limit: usize, interval: Duration) -> Self {
        Self {
            limit,
            interval,
            hits: Vec::new(),
        }
    }

    fn check(&mut self) -> bool {
        let now = Instant::now();
        self.hits.retain(|hit| *hit + self.interval > now);
        if self.hits.len() >= self.limit {
            return false;
        }
        self.hits.push(now);
        true
    }
}

/// Dispatch one parsed frame. Field problems map onto the 4003-4005 close
/// codes; an op outside the caller's role is an invalid value.
fn process_text(
    scheduler: &Scheduler,
    token_id: &str,
    role: Role,
    text: &str,
) -> Result<Option<String>, CloseCode> {
    let value: Value = serde_json::from_str(text).map_err(|_| CloseCode::InvalidJson)?;
    let object = value.as_object().ok_or(CloseCode::MissingField)?;

    let op = match object.get("op") {
        None => return Err(CloseCode::MissingField),
        Some(Value::String(op)) => op.as_str(),
        Some(_) => return Err(CloseCode::InvalidType),
    };

    match (role, op) {
        (Role::Operator, OP_QUEUE_TASK) => {
            let task_id = int_field(object, "task_id")?;
            scheduler.queue_task(task_id);
            let reply = ServerMessage::Queued { task_id };
            Ok(Some(serde_json::to_string(&reply).map_err(|_| CloseCode::InvalidValue)?))
        }
        (Role::Autopilot, OP_ACK) => {
            let task_id = int_field(object, "task_id")?;
            if !scheduler.complete(token_id, task_id) {
                return Err(CloseCode::InvalidValue);
            }
            Ok(None)
        }
        _ => Err(CloseCode::InvalidValue),
    }
}

fn int_field(object: &serde_json::Map<String, Value>, name: &str) -> Result<i64, CloseCode> {
    let value = object.get(name).ok_or(CloseCode::MissingField)?;
    let id = value.as_i64().ok_or(CloseCode::InvalidType)?;
    if id < 0 {
        return Err(CloseCode::InvalidValue);
    }
    Ok(id)
}

/// Own a WebSocket connection until teardown.
///
/// The connection was already registered under `session.connections` by
/// the upgrade handler; this task drains both the socket and the outbound
/// channel, enforces the per-connection message ratelimit, and always
/// detaches itself on the way out.
pub async fn serve_connection(
    mut socket: WebSocket,
    state: Arc<AppState>,
    ctx: AuthCtx,
    role: Role,
    mut outbound: UnboundedReceiver<Outbound>,
    settings: WsSettings,
) {
    let user = ctx.user.display().to_string();
    tracing::info!(user = %user, session_id = %ctx.session_id, "WebSocket connected");

    if role == Role::Autopilot {
        // Registration makes the worker eligible for dispatch; the handle
        // it receives feeds the same outbound channel this task drains.
        let handle = state
            .registry
            .connection_handle(&ctx.token_id, &ctx.session_id)
            .await;
        if let Some(handle) = handle {
            state.scheduler.connect(&ctx.token_id, &user, handle);
        }
    }

    let mut limiter = MessageLimiter::new(settings.message_limit, settings.message_interval);
    let mut ping_interval = interval(settings.heartbeat);
    ping_interval.tick().await; // consume the immediate first tick
    let pong_timeout = settings.heartbeat * 3;
    let mut last_pong = Instant::now();

    // (code, reason) the server decided to close with, if any.
    let mut close_with: Option<(u16, String)> = None;
    // Close code received from the peer, echoed back during teardown.
    let mut received_close: Option<u16> = None;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > pong_timeout {
                    tracing::debug!(user = %user, "WebSocket ping timeout, closing");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            pushed = outbound.recv() => {
                match pushed {
                    Some(Outbound::Text(text)) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close(code)) => {
                        close_with = Some((code, close_reason(code).to_string()));
                        break;
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !limiter.check() {
                            close_with =
                                Some((1008, "message ratelimit exceeded".to_string()));
                            break;
                        }
                        match process_text(&state.scheduler, &ctx.token_id, role, text.as_str()) {
                            Ok(Some(reply)) => {
                                if socket.send(Message::Text(reply.into())).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(code) => {
                                close_with =
                                    Some((code.code(), code.reason().to_string()));
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let code = CloseCode::InvalidFrameType;
                        close_with = Some((code.code(), code.reason().to_string()));
                        break;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        received_close = frame.map(|f| f.code);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::debug!(user = %user, "WebSocket error: {error}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    // Teardown runs regardless of why the loop exited.
    if role == Role::Autopilot {
        state.scheduler.disconnect(&ctx.token_id);
    }
    state
        .registry
        .detach_connection(&ctx.token_id, &ctx.session_id)
        .await;

    let (code, reason) = close_with
        .or(received_close.map(|code| (code, String::new())))
        .unwrap_or((1000, String::new()));
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(error) = socket.send(Message::Close(Some(frame))).await {
        tracing::error!(user = %user, code, "Failed to close WebSocket: {error}");
    }
    tracing::info!(user = %user, session_id = %ctx.session_id, code, "WebSocket disconnected");
}

fn close_reason(code: u16) -> &'static str {
    match code {
        4000 => CloseCode::TokenExpired.reason(),
        4001 => CloseCode::InvalidFrameType.reason(),
        4002 => CloseCode::InvalidJson.reason(),
        4003 => CloseCode::MissingField.reason(),
        4004 => CloseCode::InvalidType.reason(),
        4005 => CloseCode::InvalidValue.reason(),
        _ => "",
    }
}
