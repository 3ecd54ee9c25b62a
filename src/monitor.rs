// monitor.rs
//
// The checkout screen's waiting state machine. It creates the order, asks
// for the STK push, then idles on the transaction change feed with a
// visible countdown. The countdown is purely a UX affordance: its expiry
// stops the screen from waiting forever, it cancels nothing server-side,
// and the persisted order status stays the source of truth either way.
use chrono::{DateTime, Duration, Utc};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::events::TransactionEvent;
use crate::models::transaction::TransactionStatus;

/// How long the checkout screen visibly waits for the callback.
pub const COUNTDOWN_SECS: i64 = 30;

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorState {
    Idle,
    OrderCreated,
    AwaitingPayment { deadline: DateTime<Utc> },
    Succeeded { receipt: Option<String> },
    Failed { description: String },
    TimedOut,
}

#[derive(Debug)]
pub struct PaymentMonitor {
    order_id: Option<String>,
    checkout_request_id: Option<String>,
    state: MonitorState,
}

impl PaymentMonitor {
    pub fn new() -> Self {
        PaymentMonitor {
            order_id: None,
            checkout_request_id: None,
            state: MonitorState::Idle,
        }
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    /// The order id being watched. Held here explicitly so the subscription
    /// target has one owner and goes away with the monitor.
    pub fn order_id(&self) -> Option<&str> {
        self.order_id.as_deref()
    }

    pub fn checkout_request_id(&self) -> Option<&str> {
        self.checkout_request_id.as_deref()
    }

    pub fn order_created(&mut self, order_id: impl Into<String>) {
        self.order_id = Some(order_id.into());
        self.state = MonitorState::OrderCreated;
    }

    /// Starts the countdown. Called once the push request was accepted and
    /// the cart has been cleared.
    pub fn payment_initiated(&mut self, checkout_request_id: impl Into<String>, now: DateTime<Utc>) {
        self.checkout_request_id = Some(checkout_request_id.into());
        self.state = MonitorState::AwaitingPayment {
            deadline: now + Duration::seconds(COUNTDOWN_SECS),
        };
    }

    /// Re-initiates after a failure or timeout: same order, fresh checkout
    /// request id, fresh countdown. The server records a brand-new attempt.
    pub fn retry(&mut self, checkout_request_id: impl Into<String>, now: DateTime<Utc>) {
        match self.state {
            MonitorState::Failed { .. } | MonitorState::TimedOut => {
                self.payment_initiated(checkout_request_id, now);
            }
            _ => {}
        }
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match self.state {
            MonitorState::AwaitingPayment { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Applies one transaction change event. Events for other orders are
    /// ignored; the last relevant event wins, except that success is sticky:
    /// once the feed reported a completed payment, a stale failure from an
    /// abandoned attempt cannot demote it.
    pub fn apply(&mut self, event: &TransactionEvent) {
        let Some(order_id) = self.order_id.as_deref() else {
            return;
        };
        if event.transaction.order_id != order_id {
            return;
        }

        match event.transaction.status {
            TransactionStatus::Completed => {
                self.state = MonitorState::Succeeded {
                    receipt: Some(event.transaction.checkout_request_id.clone()),
                };
            }
            TransactionStatus::Failed => {
                if !matches!(self.state, MonitorState::Succeeded { .. }) {
                    self.state = MonitorState::Failed {
                        description: event
                            .transaction
                            .result_desc
                            .clone()
                            .unwrap_or_else(|| "Payment failed".to_string()),
                    };
                }
            }
            TransactionStatus::Pending => {}
        }
    }

    /// Advances the countdown. Past the deadline with no resolution the
    /// screen stops waiting and offers the way back to the shop; the
    /// payment itself keeps reconciling in the background.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        if let MonitorState::AwaitingPayment { deadline } = self.state {
            if now >= deadline {
                self.state = MonitorState::TimedOut;
            }
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self.state,
            MonitorState::Succeeded { .. } | MonitorState::Failed { .. }
        )
    }
}

impl Default for PaymentMonitor {
    fn default() -> Self {
        PaymentMonitor::new()
    }
}

/// Drives a monitor against the live change feed until it resolves or the
/// countdown runs out. Push-based: no re-fetch loop, the monitor reacts the
/// moment the callback receiver's write lands on the bus.
pub async fn drive(
    mut monitor: PaymentMonitor,
    mut events: broadcast::Receiver<TransactionEvent>,
) -> PaymentMonitor {
    loop {
        let Some(deadline) = monitor.deadline() else {
            break;
        };

        let now = Utc::now();
        if now >= deadline {
            monitor.tick(now);
            break;
        }

        let remaining = (deadline - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);

        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) => {
                monitor.apply(&event);
                if monitor.is_resolved() {
                    break;
                }
            }
            Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) => break,
            Err(_elapsed) => {
                monitor.tick(Utc::now());
                break;
            }
        }
    }

    monitor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, EventKind};
    use crate::models::transaction::Transaction;

    fn event(order_id: &str, status: TransactionStatus) -> TransactionEvent {
        let now = Utc::now();
        TransactionEvent {
            kind: EventKind::Updated,
            transaction: Transaction {
                id: None,
                order_id: order_id.to_string(),
                phone_number: "254712345678".to_string(),
                amount: 1500.0,
                checkout_request_id: "ws_CO_1".to_string(),
                merchant_request_id: None,
                response_code: "0".to_string(),
                response_description: "Success".to_string(),
                customer_message: "ok".to_string(),
                status,
                result_code: None,
                result_desc: Some("Request cancelled by user".to_string()),
                created_at: now,
                updated_at: now,
            },
        }
    }

    fn awaiting_monitor(order_id: &str, now: DateTime<Utc>) -> PaymentMonitor {
        let mut monitor = PaymentMonitor::new();
        monitor.order_created(order_id);
        monitor.payment_initiated("ws_CO_1", now);
        monitor
    }

    #[test]
    fn happy_path_resolves_to_succeeded() {
        let now = Utc::now();
        let mut monitor = awaiting_monitor("ord-1", now);
        assert!(matches!(
            monitor.state(),
            MonitorState::AwaitingPayment { .. }
        ));

        monitor.apply(&event("ord-1", TransactionStatus::Completed));
        assert!(matches!(monitor.state(), MonitorState::Succeeded { .. }));
        assert!(monitor.is_resolved());
    }

    #[test]
    fn failure_is_retryable() {
        let now = Utc::now();
        let mut monitor = awaiting_monitor("ord-1", now);

        monitor.apply(&event("ord-1", TransactionStatus::Failed));
        assert!(matches!(monitor.state(), MonitorState::Failed { .. }));

        monitor.retry("ws_CO_2", now);
        assert!(matches!(
            monitor.state(),
            MonitorState::AwaitingPayment { .. }
        ));
        assert_eq!(monitor.checkout_request_id(), Some("ws_CO_2"));
        assert_eq!(monitor.order_id(), Some("ord-1"));
    }

    #[test]
    fn events_for_other_orders_are_ignored() {
        let now = Utc::now();
        let mut monitor = awaiting_monitor("ord-1", now);

        monitor.apply(&event("ord-2", TransactionStatus::Completed));
        assert!(matches!(
            monitor.state(),
            MonitorState::AwaitingPayment { .. }
        ));
    }

    #[test]
    fn pending_insert_event_keeps_waiting() {
        let now = Utc::now();
        let mut monitor = awaiting_monitor("ord-1", now);

        monitor.apply(&event("ord-1", TransactionStatus::Pending));
        assert!(matches!(
            monitor.state(),
            MonitorState::AwaitingPayment { .. }
        ));
    }

    #[test]
    fn countdown_expiry_times_out_without_cancelling() {
        let now = Utc::now();
        let mut monitor = awaiting_monitor("ord-1", now);

        monitor.tick(now + Duration::seconds(COUNTDOWN_SECS - 1));
        assert!(matches!(
            monitor.state(),
            MonitorState::AwaitingPayment { .. }
        ));

        monitor.tick(now + Duration::seconds(COUNTDOWN_SECS));
        assert_eq!(*monitor.state(), MonitorState::TimedOut);

        // A late callback still lands: the server kept reconciling.
        monitor.apply(&event("ord-1", TransactionStatus::Completed));
        assert!(matches!(monitor.state(), MonitorState::Succeeded { .. }));
    }

    #[test]
    fn success_is_sticky_against_stale_failure() {
        let now = Utc::now();
        let mut monitor = awaiting_monitor("ord-1", now);

        monitor.apply(&event("ord-1", TransactionStatus::Completed));
        monitor.apply(&event("ord-1", TransactionStatus::Failed));
        assert!(matches!(monitor.state(), MonitorState::Succeeded { .. }));
    }

    #[test]
    fn retry_only_from_failed_or_timed_out() {
        let now = Utc::now();
        let mut monitor = awaiting_monitor("ord-1", now);
        monitor.apply(&event("ord-1", TransactionStatus::Completed));

        monitor.retry("ws_CO_2", now);
        assert!(matches!(monitor.state(), MonitorState::Succeeded { .. }));
    }

    #[tokio::test]
    async fn drive_resolves_on_pushed_event() {
        let bus = EventBus::default();
        let rx = bus.transactions_tx.subscribe();

        let monitor = awaiting_monitor("ord-1", Utc::now());

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                bus.publish_transaction(
                    EventKind::Updated,
                    event("ord-1", TransactionStatus::Completed).transaction,
                );
            })
        };

        let resolved = drive(monitor, rx).await;
        publisher.await.unwrap();

        assert!(matches!(resolved.state(), MonitorState::Succeeded { .. }));
    }
}
