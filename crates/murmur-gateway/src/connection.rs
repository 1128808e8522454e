use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};

use murmur_types::events::ClientEvent;

use crate::engine::Engine;
use crate::error::ProtocolError;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How much of a malformed frame to echo into the log.
const RAW_LOG_LIMIT: usize = 200;

/// Drive one WebSocket connection as an engine channel until either side
/// goes away, then run the disconnect transition.
pub async fn handle_connection(socket: WebSocket, engine: Engine) {
    let (channel_id, mut outbound) = engine.open_channel().await;
    let (mut sender, mut receiver) = socket.split();

    info!("Channel {} connected", channel_id);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    // Outbound queue -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = outbound.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&*event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Channel {} failed to encode event: {}", channel_id, e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Channel {} heartbeat timeout (missed {} pongs), dropping connection", channel_id, missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Client -> engine, one event at a time
    let engine_recv = engine.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => engine_recv.handle(channel_id, event).await,
                    Err(e) => {
                        let raw: String = text.chars().take(RAW_LOG_LIMIT).collect();
                        warn!("Channel {} bad event: {} -- raw: {}", channel_id, e, raw);
                        engine_recv
                            .report_error(channel_id, ProtocolError::validation("Invalid event format"))
                            .await;
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    engine.close_channel(channel_id).await;
    info!("Channel {} disconnected", channel_id);
}
