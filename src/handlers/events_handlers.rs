// handlers/events_handlers.rs
//
// Websocket change feed for the checkout and order-history screens. A
// client subscribes to transaction events for one order id (while waiting
// out the payment countdown) or to order events for one user id (status
// toasts in the profile view). Closing the socket only stops delivery;
// nothing about the payment itself is cancelled.
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, RwLock};
use tracing::{debug, warn};

use crate::events::{OrderEvent, TransactionEvent};
use crate::state::AppState;

#[derive(Deserialize, Serialize, Debug)]
#[serde(tag = "method")]
pub enum WsMessage {
    #[serde(rename = "subscribe")]
    Subscribe { params: SubscribeParams },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { params: UnsubscribeParams },
}

#[derive(Deserialize, Serialize, Debug)]
pub struct SubscribeParams {
    pub channel: String,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct UnsubscribeParams {
    pub channel: String,
}

#[derive(Serialize, Debug)]
#[serde(tag = "channel")]
enum ChannelMsg<'a> {
    #[serde(rename = "transactions")]
    Transactions { data: &'a TransactionEvent },

    #[serde(rename = "orders")]
    Orders { data: &'a OrderEvent },
}

/// What one connected client is watching. Each channel is scoped to a
/// single id, handed over explicitly at subscribe time.
#[derive(Debug, Default)]
pub struct Subscription {
    pub transactions_order_id: Option<String>,
    pub orders_user_id: Option<String>,
}

impl Subscription {
    pub fn apply(&mut self, msg: &WsMessage) {
        match msg {
            WsMessage::Subscribe { params } => match params.channel.as_str() {
                "transactions" => self.transactions_order_id = params.order_id.clone(),
                "orders" => self.orders_user_id = params.user_id.clone(),
                other => warn!("Invalid channel: {}", other),
            },
            WsMessage::Unsubscribe { params } => match params.channel.as_str() {
                "transactions" => self.transactions_order_id = None,
                "orders" => self.orders_user_id = None,
                other => warn!("Invalid channel: {}", other),
            },
        }
    }

    pub fn wants_transaction(&self, event: &TransactionEvent) -> bool {
        self.transactions_order_id.as_deref() == Some(event.transaction.order_id.as_str())
    }

    pub fn wants_order(&self, event: &OrderEvent) -> bool {
        self.orders_user_id.as_deref() == Some(event.order.user_id.as_str())
    }
}

// GET /api/events/ws
pub async fn endpoint(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    async fn handle(socket: WebSocket, state: AppState) {
        let (sender, receiver) = socket.split();
        let subscription = Arc::new(RwLock::new(Subscription::default()));

        let mut read_task = tokio::spawn(read(receiver, subscription.clone()));
        let mut write_task = tokio::spawn(write(sender, subscription, state));

        // Whichever side finishes first (usually the read side, on client
        // disconnect) takes its sibling down with it, so a closed connection
        // does not leave a write task idling on a quiet feed.
        tokio::select! {
            _ = &mut read_task => write_task.abort(),
            _ = &mut write_task => read_task.abort(),
        }
    }

    ws.on_upgrade(move |socket| handle(socket, state))
}

async fn read(mut receiver: SplitStream<WebSocket>, subscription: Arc<RwLock<Subscription>>) {
    while let Some(Ok(msg)) = receiver.next().await {
        if let Message::Text(text) = msg {
            match serde_json::from_str::<WsMessage>(&text) {
                Ok(ws_msg) => {
                    let mut subscription = subscription.write().await;
                    subscription.apply(&ws_msg);
                }
                Err(e) => warn!("Unparseable websocket message: {}", e),
            }
        }
    }
}

async fn write(
    mut sender: SplitSink<WebSocket, Message>,
    subscription: Arc<RwLock<Subscription>>,
    state: AppState,
) {
    let mut transactions_rx = state.events.transactions_tx.subscribe();
    let mut orders_rx = state.events.orders_tx.subscribe();

    loop {
        tokio::select! {
            result = transactions_rx.recv() => match result {
                Ok(event) => {
                    let subscription = subscription.read().await;
                    if subscription.wants_transaction(&event) {
                        let msg = ChannelMsg::Transactions { data: &event };
                        if send_message(&msg, &mut sender).await.is_err() {
                            break;
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Only the last relevant event per order matters, so a
                    // lagged receiver just picks up from the current write.
                    debug!("Websocket receiver lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            result = orders_rx.recv() => match result {
                Ok(event) => {
                    let subscription = subscription.read().await;
                    if subscription.wants_order(&event) {
                        let msg = ChannelMsg::Orders { data: &event };
                        if send_message(&msg, &mut sender).await.is_err() {
                            break;
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Websocket receiver lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

async fn send_message(
    msg: &ChannelMsg<'_>,
    sender: &mut SplitSink<WebSocket, Message>,
) -> std::result::Result<(), axum::Error> {
    match serde_json::to_string(msg) {
        Ok(serialized) => sender.send(Message::Text(serialized)).await,
        Err(e) => {
            warn!("Failed to serialize websocket message: {}", e);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, TransactionEvent};
    use crate::models::transaction::{Transaction, TransactionStatus};
    use chrono::Utc;

    fn transaction_event(order_id: &str) -> TransactionEvent {
        let now = Utc::now();
        TransactionEvent {
            kind: EventKind::Updated,
            transaction: Transaction {
                id: None,
                order_id: order_id.to_string(),
                phone_number: "254712345678".to_string(),
                amount: 100.0,
                checkout_request_id: "ws_CO_1".to_string(),
                merchant_request_id: None,
                response_code: "0".to_string(),
                response_description: "Success".to_string(),
                customer_message: "ok".to_string(),
                status: TransactionStatus::Completed,
                result_code: Some(0),
                result_desc: None,
                created_at: now,
                updated_at: now,
            },
        }
    }

    #[test]
    fn subscription_filters_by_order_id() {
        let mut sub = Subscription::default();
        assert!(!sub.wants_transaction(&transaction_event("ord-1")));

        sub.apply(&WsMessage::Subscribe {
            params: SubscribeParams {
                channel: "transactions".to_string(),
                order_id: Some("ord-1".to_string()),
                user_id: None,
            },
        });
        assert!(sub.wants_transaction(&transaction_event("ord-1")));
        assert!(!sub.wants_transaction(&transaction_event("ord-2")));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let mut sub = Subscription::default();
        sub.apply(&WsMessage::Subscribe {
            params: SubscribeParams {
                channel: "transactions".to_string(),
                order_id: Some("ord-1".to_string()),
                user_id: None,
            },
        });
        sub.apply(&WsMessage::Unsubscribe {
            params: UnsubscribeParams {
                channel: "transactions".to_string(),
            },
        });
        assert!(!sub.wants_transaction(&transaction_event("ord-1")));
    }

    #[test]
    fn unknown_channel_is_ignored() {
        let mut sub = Subscription::default();
        sub.apply(&WsMessage::Subscribe {
            params: SubscribeParams {
                channel: "products".to_string(),
                order_id: Some("ord-1".to_string()),
                user_id: None,
            },
        });
        assert!(sub.transactions_order_id.is_none());
        assert!(sub.orders_user_id.is_none());
    }
}
