// models/transaction.rs
use chrono::{DateTime, Utc};
use mongodb::bson;
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const ACCOUNT_REFERENCE_PREFIX: &str = "ORDER_";

/// Sentinel used when a callback carries no recoverable order id.
pub const UNKNOWN_ORDER_ID: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }
}

/// One payment attempt. A retry inserts a fresh row with a new checkout
/// request id; earlier rows are never touched by the retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,

    pub order_id: String,
    pub phone_number: String,
    pub amount: f64,

    // M-Pesa fields
    pub checkout_request_id: String,
    pub merchant_request_id: Option<String>,
    pub response_code: String,
    pub response_description: String,
    pub customer_message: String,

    // Status tracking
    pub status: TransactionStatus,
    pub result_code: Option<i64>,
    pub result_desc: Option<String>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Callback envelope (Daraja wire format)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct MpesaCallback {
    #[serde(rename = "Body")]
    pub body: CallbackBody,
}

#[derive(Debug, Deserialize)]
pub struct CallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,

    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,

    /// Daraja sends this as either a number or a string ("0"), so it is
    /// kept raw and interpreted through [`StkCallback::result_code`].
    #[serde(rename = "ResultCode")]
    result_code: serde_json::Value,

    #[serde(rename = "ResultDesc")]
    pub result_desc: String,

    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

impl StkCallback {
    /// 0 signals success; anything unparseable counts as failure.
    pub fn result_code(&self) -> i64 {
        match &self.result_code {
            serde_json::Value::Number(n) => n.as_i64().unwrap_or(-1),
            serde_json::Value::String(s) => s.trim().parse().unwrap_or(-1),
            _ => -1,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result_code() == 0
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize)]
pub struct MetadataItem {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Value", default)]
    pub value: serde_json::Value,
}

/// Fields pulled out of `CallbackMetadata.Item[]`.
///
/// The items arrive in arbitrary order with any subset absent, so a
/// name-to-value map is built once and every field is optional with an
/// explicit default.
#[derive(Debug, PartialEq)]
pub struct CallbackFields {
    pub order_id: String,
    pub receipt_number: Option<String>,
    pub amount: Option<f64>,
    pub phone_number: Option<String>,
}

impl CallbackFields {
    pub fn from_metadata(metadata: Option<&CallbackMetadata>) -> Self {
        let map: HashMap<&str, &serde_json::Value> = metadata
            .map(|m| {
                m.items
                    .iter()
                    .map(|item| (item.name.as_str(), &item.value))
                    .collect()
            })
            .unwrap_or_default();

        let order_id = map
            .get("AccountReference")
            .and_then(|v| v.as_str())
            .and_then(|s| s.strip_prefix(ACCOUNT_REFERENCE_PREFIX))
            .filter(|s| !s.is_empty())
            .unwrap_or(UNKNOWN_ORDER_ID)
            .to_string();

        let receipt_number = map
            .get("MpesaReceiptNumber")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        // The amount comes back as a number, but tolerate a string too.
        let amount = map.get("Amount").and_then(|v| match v {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        });

        // Phone numbers arrive as bare integers (254712345678).
        let phone_number = map.get("PhoneNumber").map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        });

        CallbackFields {
            order_id,
            receipt_number,
            amount,
            phone_number,
        }
    }

    pub fn has_order_id(&self) -> bool {
        self.order_id != UNKNOWN_ORDER_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn callback(value: serde_json::Value) -> StkCallback {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn result_code_accepts_number_and_string() {
        let cb = callback(json!({
            "MerchantRequestID": "m-1",
            "CheckoutRequestID": "ws_CO_1",
            "ResultCode": 0,
            "ResultDesc": "Success"
        }));
        assert_eq!(cb.result_code(), 0);
        assert!(cb.is_success());

        let cb = callback(json!({
            "MerchantRequestID": "m-1",
            "CheckoutRequestID": "ws_CO_1",
            "ResultCode": "0",
            "ResultDesc": "Success"
        }));
        assert!(cb.is_success());

        let cb = callback(json!({
            "MerchantRequestID": "m-1",
            "CheckoutRequestID": "ws_CO_1",
            "ResultCode": "1032",
            "ResultDesc": "Request cancelled by user"
        }));
        assert_eq!(cb.result_code(), 1032);
        assert!(!cb.is_success());
    }

    #[test]
    fn garbage_result_code_is_failure() {
        let cb = callback(json!({
            "MerchantRequestID": "m-1",
            "CheckoutRequestID": "ws_CO_1",
            "ResultCode": "not-a-number",
            "ResultDesc": "??"
        }));
        assert!(!cb.is_success());
    }

    #[test]
    fn metadata_extraction_any_order() {
        let metadata: CallbackMetadata = serde_json::from_value(json!({
            "Item": [
                {"Name": "PhoneNumber", "Value": 254712345678u64},
                {"Name": "Amount", "Value": 1500.0},
                {"Name": "MpesaReceiptNumber", "Value": "QGR123"},
                {"Name": "AccountReference", "Value": "ORDER_ord-1"}
            ]
        }))
        .unwrap();

        let fields = CallbackFields::from_metadata(Some(&metadata));
        assert_eq!(fields.order_id, "ord-1");
        assert!(fields.has_order_id());
        assert_eq!(fields.receipt_number.as_deref(), Some("QGR123"));
        assert_eq!(fields.amount, Some(1500.0));
        assert_eq!(fields.phone_number.as_deref(), Some("254712345678"));
    }

    #[test]
    fn metadata_extraction_partial_items() {
        let metadata: CallbackMetadata = serde_json::from_value(json!({
            "Item": [
                {"Name": "Amount", "Value": "250"}
            ]
        }))
        .unwrap();

        let fields = CallbackFields::from_metadata(Some(&metadata));
        assert_eq!(fields.order_id, UNKNOWN_ORDER_ID);
        assert!(!fields.has_order_id());
        assert_eq!(fields.receipt_number, None);
        assert_eq!(fields.amount, Some(250.0));
        assert_eq!(fields.phone_number, None);
    }

    #[test]
    fn missing_metadata_defaults_everything() {
        let fields = CallbackFields::from_metadata(None);
        assert_eq!(fields.order_id, UNKNOWN_ORDER_ID);
        assert_eq!(fields.receipt_number, None);
        assert_eq!(fields.amount, None);
        assert_eq!(fields.phone_number, None);
    }

    #[test]
    fn account_reference_without_prefix_is_unknown() {
        let metadata: CallbackMetadata = serde_json::from_value(json!({
            "Item": [
                {"Name": "AccountReference", "Value": "ord-1"}
            ]
        }))
        .unwrap();

        let fields = CallbackFields::from_metadata(Some(&metadata));
        assert_eq!(fields.order_id, UNKNOWN_ORDER_ID);
    }

    #[test]
    fn full_envelope_parses() {
        let payload = json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": "ws_CO_191220191020363925",
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {
                        "Item": [
                            {"Name": "Amount", "Value": 1.00},
                            {"Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV"},
                            {"Name": "TransactionDate", "Value": 20191219102115u64},
                            {"Name": "PhoneNumber", "Value": 254708374149u64}
                        ]
                    }
                }
            }
        });

        let cb: MpesaCallback = serde_json::from_value(payload).unwrap();
        let stk = cb.body.stk_callback;
        assert!(stk.is_success());
        assert_eq!(stk.checkout_request_id, "ws_CO_191220191020363925");

        let fields = CallbackFields::from_metadata(stk.callback_metadata.as_ref());
        assert_eq!(fields.receipt_number.as_deref(), Some("NLJ7RT61SV"));
        assert_eq!(fields.order_id, UNKNOWN_ORDER_ID);
    }

    #[test]
    fn envelope_without_metadata_parses() {
        let payload = json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": "ws_CO_1",
                    "ResultCode": 1032,
                    "ResultDesc": "Request cancelled by user"
                }
            }
        });

        let cb: MpesaCallback = serde_json::from_value(payload).unwrap();
        assert!(cb.body.stk_callback.callback_metadata.is_none());
    }
}
