// models/order.rs
use chrono::{DateTime, Utc};
use mongodb::bson;
use mongodb::bson::{doc, oid::ObjectId, Document};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// Admin-side transitions only. `paid` is never reachable from here:
    /// it is written exclusively through a [`PaymentConfirmation`].
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Paid, Shipped) => true,
            (Shipped, Delivered) => true,
            (from, Cancelled) => from != Cancelled,
            _ => false,
        }
    }
}

/// Snapshot of a product at the time the order was placed, not a live
/// reference. Price changes after checkout do not affect existing orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: String,
    pub name: String,
    pub price: f64,
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub user_id: String,
    pub items: Vec<OrderItem>,
    pub total_price: f64,
    pub phone_number: String,
    pub delivery_address: String,

    pub status: OrderStatus,

    /// Processor receipt id, stamped when the payment callback confirms.
    pub transaction_id: Option<String>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrder {
    pub user_id: String,
    pub items: Vec<OrderItem>,
    pub total_price: f64,
    pub phone_number: String,
    pub delivery_address: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateOrderStatus {
    pub status: OrderStatus,
}

/// Proof that the payment processor confirmed funds movement.
///
/// The only constructor requires a success result code from a processor
/// callback, so the `paid` update below cannot be built anywhere else in
/// the crate. Admin status updates go through [`OrderStatus::can_transition_to`],
/// which rejects `paid` outright.
#[derive(Debug)]
pub struct PaymentConfirmation {
    receipt: String,
}

impl PaymentConfirmation {
    /// Returns `None` unless `result_code` signals success. The receipt id
    /// falls back to the checkout request id, then to a synthetic
    /// timestamp-based id, matching what gets stamped on the order.
    pub fn from_callback(
        result_code: i64,
        receipt_number: Option<&str>,
        checkout_request_id: &str,
    ) -> Option<Self> {
        if result_code != 0 {
            return None;
        }

        let receipt = match receipt_number.filter(|r| !r.is_empty()) {
            Some(r) => r.to_string(),
            None if !checkout_request_id.is_empty() => checkout_request_id.to_string(),
            None => format!("TXN{}", Utc::now().timestamp()),
        };

        Some(PaymentConfirmation { receipt })
    }

    pub fn receipt(&self) -> &str {
        &self.receipt
    }

    /// The `$set` document for promoting an order. Applying it twice is a
    /// no-op, so duplicate callback deliveries are harmless.
    pub fn paid_update(&self) -> Document {
        doc! {
            "$set": {
                "status": OrderStatus::Paid.as_str(),
                "transaction_id": &self.receipt,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paid_is_not_an_admin_transition() {
        for from in [
            OrderStatus::Pending,
            OrderStatus::Paid,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
            OrderStatus::Cancelled,
        ] {
            assert!(!from.can_transition_to(OrderStatus::Paid));
        }
    }

    #[test]
    fn fulfilment_transitions() {
        assert!(OrderStatus::Paid.can_transition_to(OrderStatus::Shipped));
        assert!(OrderStatus::Shipped.can_transition_to(OrderStatus::Delivered));
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Shipped));
        assert!(!OrderStatus::Delivered.can_transition_to(OrderStatus::Shipped));
    }

    #[test]
    fn no_way_back_to_pending() {
        for from in [
            OrderStatus::Paid,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
            OrderStatus::Cancelled,
        ] {
            assert!(!from.can_transition_to(OrderStatus::Pending));
        }
    }

    #[test]
    fn cancel_from_anywhere_except_cancelled() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Cancelled));
        assert!(OrderStatus::Paid.can_transition_to(OrderStatus::Cancelled));
        assert!(OrderStatus::Shipped.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Cancelled.can_transition_to(OrderStatus::Cancelled));
    }

    #[test]
    fn confirmation_requires_success_code() {
        assert!(PaymentConfirmation::from_callback(1032, Some("QGR123"), "ws_CO_1").is_none());
        assert!(PaymentConfirmation::from_callback(1, None, "ws_CO_1").is_none());
        assert!(PaymentConfirmation::from_callback(0, Some("QGR123"), "ws_CO_1").is_some());
    }

    #[test]
    fn receipt_falls_back_to_checkout_request_id() {
        let conf = PaymentConfirmation::from_callback(0, Some("QGR123"), "ws_CO_1").unwrap();
        assert_eq!(conf.receipt(), "QGR123");

        let conf = PaymentConfirmation::from_callback(0, None, "ws_CO_1").unwrap();
        assert_eq!(conf.receipt(), "ws_CO_1");

        let conf = PaymentConfirmation::from_callback(0, Some(""), "ws_CO_1").unwrap();
        assert_eq!(conf.receipt(), "ws_CO_1");

        let conf = PaymentConfirmation::from_callback(0, None, "").unwrap();
        assert!(conf.receipt().starts_with("TXN"));
    }

    #[test]
    fn paid_update_sets_status_and_receipt() {
        let conf = PaymentConfirmation::from_callback(0, Some("QGR123"), "ws_CO_1").unwrap();
        let update = conf.paid_update();
        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get_str("status").unwrap(), "paid");
        assert_eq!(set.get_str("transaction_id").unwrap(), "QGR123");
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&OrderStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::from_str::<OrderStatus>("\"paid\"").unwrap(),
            OrderStatus::Paid
        );
    }
}
