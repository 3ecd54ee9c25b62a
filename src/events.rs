// events.rs
//
// Realtime change feed for the checkout client: every Transaction/Order
// write publishes an event here, and the websocket endpoint fans them out
// to subscribed clients. Dropping a receiver never affects the writes.
use tokio::sync::broadcast;
use serde::Serialize;

use crate::models::order::Order;
use crate::models::transaction::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionEvent {
    pub kind: EventKind,
    pub transaction: Transaction,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderEvent {
    pub kind: EventKind,
    pub order: Order,
}

#[derive(Clone)]
pub struct EventBus {
    pub transactions_tx: broadcast::Sender<TransactionEvent>,
    pub orders_tx: broadcast::Sender<OrderEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (transactions_tx, _) = broadcast::channel(capacity);
        let (orders_tx, _) = broadcast::channel(capacity);
        EventBus {
            transactions_tx,
            orders_tx,
        }
    }

    /// Sending with no subscribers is fine; nobody watching is the normal
    /// case once a customer has navigated away.
    pub fn publish_transaction(&self, kind: EventKind, transaction: Transaction) {
        let _ = self.transactions_tx.send(TransactionEvent { kind, transaction });
    }

    pub fn publish_order(&self, kind: EventKind, order: Order) {
        let _ = self.orders_tx.send(OrderEvent { kind, order });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(64)
    }
}
