// src/websocket.rs
use crate::streaming::{PriceStreamer, PriceTick};
use futures::{SinkExt, StreamExt};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

#[derive(Debug, Deserialize)]
struct ClientEvent {
    event: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    symbols: Option<Vec<String>>,
}

fn event(name: &str, data: Value) -> Value {
    json!({ "event": name, "data": data })
}

fn error_event(message: &str) -> Value {
    event("error", json!({ "message": message }))
}

/// Per-socket state: the users whose ticks this socket receives.
pub struct Connection {
    id: String,
    users: BTreeSet<String>,
}

impl Connection {
    pub fn new() -> Self {
        Connection {
            id: Uuid::new_v4().to_string(),
            users: BTreeSet::new(),
        }
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies one client event and returns the reply to send back.
pub async fn handle_client_event(
    streamer: &PriceStreamer,
    conn: &mut Connection,
    text: &str,
) -> Value {
    let request: ClientEvent = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            warn!("Malformed websocket message: {}", e);
            return error_event("Malformed message");
        }
    };
    let user_id = request.user_id.filter(|u| !u.is_empty());

    match request.event.as_str() {
        "get_stream_status" => event("stream_status", json!(streamer.status().await)),
        "subscribe_market_indices" => {
            let user_id = user_id.unwrap_or_else(|| conn.id.clone());
            streamer.subscribe_market_indices(&user_id);
            conn.users.insert(user_id.clone());
            event(
                "market_indices_subscription_status",
                json!({
                    "status": "subscribed",
                    "user_id": user_id,
                    "message": "Successfully subscribed to market indices updates"
                }),
            )
        }
        "unsubscribe_market_indices" => {
            let user_id = user_id.unwrap_or_else(|| conn.id.clone());
            streamer.unsubscribe_market_indices(&user_id);
            event(
                "market_indices_subscription_status",
                json!({
                    "status": "unsubscribed",
                    "user_id": user_id,
                    "message": "Successfully unsubscribed from market indices updates"
                }),
            )
        }
        name @ ("subscribe_prices" | "unsubscribe_prices" | "subscribe_watchlist"
        | "unsubscribe_watchlist") => {
            let Some(user_id) = user_id else {
                return error_event("User ID required");
            };
            user_event(streamer, conn, name, user_id, request.symbols).await
        }
        other => {
            warn!("Unknown websocket event {:?}", other);
            error_event("Unknown event")
        }
    }
}

async fn user_event(
    streamer: &PriceStreamer,
    conn: &mut Connection,
    name: &str,
    user_id: String,
    symbols: Option<Vec<String>>,
) -> Value {
    match name {
        "subscribe_prices" => match streamer.subscribe_holdings(&user_id, symbols).await {
            Ok(true) => {
                conn.users.insert(user_id.clone());
                info!("User {} subscribed to price updates", user_id);
                event(
                    "subscription_status",
                    json!({
                        "status": "subscribed",
                        "user_id": user_id,
                        "message": "Successfully subscribed to price updates"
                    }),
                )
            }
            Ok(false) => error_event("Failed to subscribe to price updates"),
            Err(e) => {
                error!("Error subscribing {} to prices: {}", user_id, e);
                error_event("Failed to subscribe to price updates")
            }
        },
        "unsubscribe_prices" => {
            streamer.unsubscribe_user(&user_id);
            conn.users.remove(&user_id);
            event(
                "subscription_status",
                json!({
                    "status": "unsubscribed",
                    "user_id": user_id,
                    "message": "Successfully unsubscribed from price updates"
                }),
            )
        }
        "subscribe_watchlist" => {
            let symbols = symbols.unwrap_or_default();
            if symbols.is_empty() {
                return error_event("Symbols list required");
            }
            if !streamer.subscribe_watchlist(&user_id, &symbols) {
                return error_event("Failed to subscribe to watchlist updates");
            }
            conn.users.insert(user_id.clone());
            event(
                "watchlist_subscription_status",
                json!({
                    "status": "subscribed",
                    "user_id": user_id,
                    "symbols": symbols,
                    "message": "Successfully subscribed to watchlist updates"
                }),
            )
        }
        _ => {
            streamer.unsubscribe_watchlist(&user_id);
            event(
                "watchlist_subscription_status",
                json!({
                    "status": "unsubscribed",
                    "user_id": user_id,
                    "message": "Successfully unsubscribed from watchlist updates"
                }),
            )
        }
    }
}

/// Events this socket should emit for one tick.
pub fn tick_events(streamer: &PriceStreamer, conn: &Connection, tick: &PriceTick) -> Vec<Value> {
    let mut events = Vec::new();
    for user_id in &conn.users {
        for kind in streamer.routes_for(user_id, &tick.symbol) {
            events.push(event(kind.event(), json!(tick)));
        }
    }
    events
}

pub async fn client_connection(ws: WebSocket, streamer: Arc<PriceStreamer>) {
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();

    tokio::task::spawn(async move {
        while let Some(value) = out_rx.recv().await {
            if let Err(e) = sink.send(Message::text(value.to_string())).await {
                warn!("Websocket send failed: {}", e);
                break;
            }
        }
    });

    let mut conn = Connection::new();
    let mut ticks = streamer.ticks();
    info!("Client connected: {}", conn.id);
    let _ = out_tx.send(event(
        "connected",
        json!({ "status": "Connected to price streaming service" }),
    ));

    loop {
        tokio::select! {
            incoming = stream.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("Websocket error on {}: {}", conn.id, e);
                        break;
                    }
                    None => break,
                };
                if msg.is_close() {
                    break;
                }
                let Ok(text) = msg.to_str() else {
                    continue;
                };
                let reply = handle_client_event(&streamer, &mut conn, text).await;
                if out_tx.send(reply).is_err() {
                    break;
                }
            }
            tick = ticks.recv() => {
                match tick {
                    Ok(tick) => {
                        for value in tick_events(&streamer, &conn, &tick) {
                            let _ = out_tx.send(value);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Client {} lagged by {} ticks", conn.id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    // Anonymous index subscriptions die with the socket.
    streamer.unsubscribe_market_indices(&conn.id);
    info!("Client disconnected: {}", conn.id);
}
