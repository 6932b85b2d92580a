//! HTTP/WS boundary.
//!
//! Deliberately thin per SPEC_FULL §2.1: `/health`, a WebSocket upgrade that
//! deserializes bet requests and fans out engine events, and the recharge
//! webhook. The real OAuth/session surface and the client-facing gateway's
//! own protocol framing are out of scope (§1) — this stands in for them with
//! the minimum shape needed to drive the engine end to end.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::BetRequest;
use crate::AppState;

pub async fn health_check() -> &'static str {
    "ok"
}

/// Inbound WebSocket envelope. The real gateway attaches `userId` from the
/// authenticated session before forwarding the bet request (§1); this thin
/// boundary carries it alongside the request body instead.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundMessage {
    Bet {
        user_id: String,
        #[serde(flatten)]
        request: BetRequest,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BetAck {
    BetAccepted {
        bet_id: String,
        order_id: String,
        multiplier: f64,
        amount_cents: i64,
    },
    BetRejected {
        order_id: String,
        error: String,
    },
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut events = state.events.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let msg = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                        if socket.send(Message::Text(msg)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "ws client lagged behind engine event stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound_text(&mut socket, &state, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "ws recv error");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_inbound_text(socket: &mut WebSocket, state: &AppState, text: &str) {
    let parsed: Result<InboundMessage, _> = serde_json::from_str(text);
    let InboundMessage::Bet { user_id, request } = match parsed {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "failed to parse inbound ws message");
            return;
        }
    };

    let order_id = request.order_id.clone();
    let ack = match state.round_engine.place_bet(user_id, request).await {
        Ok(outcome) => BetAck::BetAccepted {
            bet_id: outcome.bet_id,
            order_id: outcome.order_id,
            multiplier: outcome.multiplier,
            amount_cents: outcome.amount_cents,
        },
        Err(e) => BetAck::BetRejected {
            order_id,
            error: e.to_string(),
        },
    };

    let msg = serde_json::to_string(&ack).unwrap_or_else(|_| "{}".to_string());
    let _ = socket.send(Message::Text(msg)).await;
}

/// Payload carried by the payment gateway's recharge webhook (§6.5).
/// Signature verification is the gateway's own HMAC scheme and is out of
/// scope; `sign` is accepted and required non-empty so the contract shape
/// matches what upstream actually sends.
#[derive(Debug, Deserialize)]
pub struct RechargeWebhookRequest {
    pub order_no: String,
    pub trade_no: String,
    pub amount_cents: i64,
    pub sign: String,
}

#[derive(Debug, Serialize)]
pub struct RechargeWebhookResponse {
    pub processed: bool,
}

pub async fn recharge_webhook(
    State(state): State<AppState>,
    Json(payload): Json<RechargeWebhookRequest>,
) -> impl IntoResponse {
    if payload.sign.trim().is_empty() {
        return (axum::http::StatusCode::BAD_REQUEST, Json(RechargeWebhookResponse { processed: false }));
    }

    match state
        .ledger
        .complete_recharge_order(&payload.order_no, &payload.trade_no, payload.amount_cents)
        .await
    {
        Ok(result) => (axum::http::StatusCode::OK, Json(RechargeWebhookResponse { processed: result.processed })),
        Err(e) => {
            warn!(error = %e, order_no = %payload.order_no, "recharge webhook failed");
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(RechargeWebhookResponse { processed: false }),
            )
        }
    }
}
