// handlers/payment_handlers.rs
use axum::{
    extract::{Json, Query, State},
    response::Json as JsonResponse,
};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::{
    bson::{self, doc, oid::ObjectId},
    Collection,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::errors::{AppError, Result};
use crate::events::EventKind;
use crate::models::order::{Order, OrderStatus, PaymentConfirmation};
use crate::models::transaction::{
    CallbackFields, MpesaCallback, StkCallback, Transaction, TransactionStatus,
};
use crate::services::mpesa_service::{normalize_phone, StkPushResponse};
use crate::state::AppState;

/// Trailing window inside which a second push for the same phone is
/// rejected. Long enough to suppress a double-click, short enough that a
/// genuine retry after a failed prompt is not locked out.
pub const GUARD_WINDOW_SECS: i64 = 60;

pub fn guard_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - chrono::Duration::seconds(GUARD_WINDOW_SECS)
}

pub fn within_guard_window(created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    created_at > guard_cutoff(now)
}

#[derive(Debug, Deserialize)]
pub struct InitiatePaymentRequest {
    pub amount: f64,
    pub phone_number: String,
    pub order_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub checkout_request_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    pub order_id: Option<String>,
}

fn transactions(state: &AppState) -> Collection<Transaction> {
    state.db.collection("transactions")
}

/// Builds the row for one push attempt. A retry for the same order goes
/// through here again with the processor's fresh checkout request id and
/// gets a brand-new row; earlier attempt rows are never reused or mutated
/// by initiation.
fn new_attempt(
    order_id: &str,
    phone: &str,
    amount: f64,
    response: &StkPushResponse,
    now: DateTime<Utc>,
) -> Transaction {
    Transaction {
        id: Some(ObjectId::new()),
        order_id: order_id.to_string(),
        phone_number: phone.to_string(),
        amount,
        checkout_request_id: response.checkout_request_id.clone(),
        merchant_request_id: Some(response.merchant_request_id.clone()),
        response_code: response.response_code.clone(),
        response_description: response.response_description.clone(),
        customer_message: response.customer_message.clone(),
        status: TransactionStatus::Pending,
        result_code: None,
        result_desc: None,
        created_at: now,
        updated_at: now,
    }
}

fn orders(state: &AppState) -> Collection<Order> {
    state.db.collection("orders")
}

// POST /api/mpesa/stk-push
//
// Sends the payment prompt and records a pending transaction. The order is
// deliberately not touched here: a sent prompt proves nothing about funds,
// and only the callback may promote an order.
pub async fn initiate_stk_push(
    State(state): State<AppState>,
    Json(request): Json<InitiatePaymentRequest>,
) -> Result<JsonResponse<Value>> {
    info!(
        "STK push requested for order {} ({} KSh)",
        request.order_id, request.amount
    );

    let mpesa_service = state.mpesa_service.as_ref().ok_or_else(|| {
        error!("M-Pesa service not available");
        AppError::ServiceUnavailable("M-Pesa service is not available".to_string())
    })?;

    if request.order_id.trim().is_empty() {
        return Err(AppError::invalid_data("order_id is required"));
    }
    if request.phone_number.trim().is_empty() {
        return Err(AppError::invalid_data("phone_number is required"));
    }
    if request.amount <= 0.0 {
        return Err(AppError::invalid_data("amount must be greater than 0"));
    }

    let phone = normalize_phone(&request.phone_number);
    let collection = transactions(&state);

    // Duplicate-attempt guard: the processor rejects overlapping prompts to
    // the same subscriber, and a double prompt confuses the customer.
    let cutoff = guard_cutoff(Utc::now());
    let in_flight = collection
        .find_one(doc! {
            "phone_number": &phone,
            "status": TransactionStatus::Pending.as_str(),
            "created_at": { "$gt": bson::DateTime::from_chrono(cutoff) },
        })
        .await?;

    if let Some(existing) = in_flight {
        warn!(
            "Rejecting duplicate STK push for {}: attempt {} still pending",
            phone, existing.checkout_request_id
        );
        return Err(AppError::TransactionInProgress);
    }

    let response = mpesa_service
        .initiate_stk_push(&phone, request.amount, &request.order_id)
        .await?;

    let transaction = new_attempt(
        &request.order_id,
        &phone,
        request.amount,
        &response,
        Utc::now(),
    );

    collection.insert_one(&transaction).await?;
    state
        .events
        .publish_transaction(EventKind::Inserted, transaction);

    info!("STK push recorded: {}", response.checkout_request_id);

    Ok(JsonResponse(json!({
        "success": true,
        "checkoutRequestID": response.checkout_request_id,
        "merchantRequestID": response.merchant_request_id,
        "responseCode": response.response_code,
        "responseDescription": response.response_description,
        "customerMessage": response.customer_message,
        "callbackUrl": mpesa_service.callback_url(),
    })))
}

// POST /api/mpesa/callback
//
// Daraja retries delivery unless it gets a success acknowledgement, so this
// handler acknowledges unconditionally. Internal failures are logged, never
// surfaced; the body is taken raw so even non-JSON payloads get the ack.
pub async fn mpesa_callback(State(state): State<AppState>, body: String) -> JsonResponse<Value> {
    match process_callback(&state, &body).await {
        Ok(Some(summary)) => info!("M-Pesa callback processed: {}", summary),
        Ok(None) => {}
        Err(e) => error!("Error processing M-Pesa callback: {}", e),
    }

    acknowledge()
}

fn acknowledge() -> JsonResponse<Value> {
    JsonResponse(json!({
        "ResultCode": 0,
        "ResultDesc": "Success"
    }))
}

/// A malformed envelope is a non-fatal no-op, not an error.
pub(crate) fn parse_callback(body: &str) -> Option<StkCallback> {
    match serde_json::from_str::<MpesaCallback>(body) {
        Ok(callback) => Some(callback.body.stk_callback),
        Err(e) => {
            warn!("Malformed M-Pesa callback payload, ignoring: {}", e);
            None
        }
    }
}

async fn process_callback(state: &AppState, body: &str) -> Result<Option<String>> {
    let Some(stk) = parse_callback(body) else {
        return Ok(None);
    };

    let fields = CallbackFields::from_metadata(stk.callback_metadata.as_ref());
    let collection = transactions(state);
    let filter = doc! { "checkout_request_id": &stk.checkout_request_id };

    if collection.find_one(filter.clone()).await?.is_none() {
        warn!(
            "Callback for unknown checkout request id {}",
            stk.checkout_request_id
        );
        return Ok(None);
    }

    let result_code = stk.result_code();
    let status = if stk.is_success() {
        TransactionStatus::Completed
    } else {
        TransactionStatus::Failed
    };
    let customer_message = if stk.is_success() {
        "Payment received successfully".to_string()
    } else {
        stk.result_desc.clone()
    };

    // The transaction row records the true outcome either way, so the
    // attempt history stays honest even for declines.
    collection
        .update_one(
            filter.clone(),
            doc! {
                "$set": {
                    "status": status.as_str(),
                    "merchant_request_id": &stk.merchant_request_id,
                    "result_code": result_code,
                    "result_desc": &stk.result_desc,
                    "customer_message": &customer_message,
                    "updated_at": bson::DateTime::from_chrono(Utc::now()),
                }
            },
        )
        .await?;

    if let Some(updated) = collection.find_one(filter).await? {
        state
            .events
            .publish_transaction(EventKind::Updated, updated);
    }

    let confirmation = PaymentConfirmation::from_callback(
        result_code,
        fields.receipt_number.as_deref(),
        &stk.checkout_request_id,
    );

    match confirmation {
        Some(confirmation) if fields.has_order_id() => {
            promote_order(state, &fields.order_id, &confirmation).await?;
            Ok(Some(format!(
                "order {} paid (receipt {})",
                fields.order_id,
                confirmation.receipt()
            )))
        }
        Some(_) => {
            warn!(
                "Successful callback {} carried no recoverable order id",
                stk.checkout_request_id
            );
            Ok(Some(format!(
                "transaction {} completed, order unknown",
                stk.checkout_request_id
            )))
        }
        None => {
            keep_order_retryable(state, &fields).await?;
            Ok(Some(format!(
                "payment failed for {} ({}): {}",
                stk.checkout_request_id, result_code, stk.result_desc
            )))
        }
    }
}

/// The only writer of the `paid` status. The `PaymentConfirmation` argument
/// can only be built from a success result code, which is what makes that
/// hold structurally rather than by convention.
async fn promote_order(
    state: &AppState,
    order_id: &str,
    confirmation: &PaymentConfirmation,
) -> Result<()> {
    let oid = match ObjectId::parse_str(order_id) {
        Ok(oid) => oid,
        Err(e) => {
            warn!("Callback carried unparseable order id {}: {}", order_id, e);
            return Ok(());
        }
    };

    let collection = orders(state);
    collection
        .update_one(doc! { "_id": oid }, confirmation.paid_update())
        .await?;

    if let Some(order) = collection.find_one(doc! { "_id": oid }).await? {
        state.events.publish_order(EventKind::Updated, order.clone());

        // Fire and forget: the receipt email must never delay or fail the
        // acknowledgement to the processor.
        if let Some(email_service) = state.email_service.clone() {
            let user_id = order.user_id.clone();
            let amount = order.total_price;
            let receipt = confirmation.receipt().to_string();
            let order_hex = oid.to_hex();
            tokio::spawn(async move {
                if let Err(e) = email_service
                    .send_payment_receipt(&user_id, &order_hex, amount, &receipt)
                    .await
                {
                    error!("Failed to send payment receipt email: {}", e);
                }
            });
        }
    }

    Ok(())
}

/// A declined or cancelled attempt leaves the order `pending` so the
/// customer can retry from the same order. The filter excludes `paid`: a
/// stale failure callback from an abandoned first attempt must not demote
/// an order a later attempt already paid for.
async fn keep_order_retryable(state: &AppState, fields: &CallbackFields) -> Result<()> {
    if !fields.has_order_id() {
        return Ok(());
    }

    let oid = match ObjectId::parse_str(&fields.order_id) {
        Ok(oid) => oid,
        Err(_) => return Ok(()),
    };

    orders(state)
        .update_one(
            doc! {
                "_id": oid,
                "status": { "$ne": OrderStatus::Paid.as_str() },
            },
            doc! { "$set": { "status": OrderStatus::Pending.as_str() } },
        )
        .await?;

    Ok(())
}

// GET /api/mpesa/status?checkout_request_id=...
pub async fn check_transaction_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<JsonResponse<Value>> {
    let transaction = transactions(&state)
        .find_one(doc! { "checkout_request_id": &query.checkout_request_id })
        .await?
        .ok_or(AppError::TransactionNotFound)?;

    Ok(JsonResponse(json!({
        "checkout_request_id": transaction.checkout_request_id,
        "order_id": transaction.order_id,
        "status": transaction.status,
        "result_code": transaction.result_code,
        "result_desc": transaction.result_desc,
        "customer_message": transaction.customer_message,
        "updated_at": transaction.updated_at.to_rfc3339(),
    })))
}

// GET /api/mpesa/transactions
pub async fn get_transactions(
    State(state): State<AppState>,
    Query(query): Query<TransactionsQuery>,
) -> Result<JsonResponse<Vec<Transaction>>> {
    let mut filter = doc! {};
    if let Some(order_id) = &query.order_id {
        filter.insert("order_id", order_id);
    }

    let cursor = transactions(&state).find(filter).await?;
    let mut rows: Vec<Transaction> = cursor.try_collect().await?;

    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    Ok(JsonResponse(rows))
}

// GET /api/mpesa/stats
pub async fn get_stats(State(state): State<AppState>) -> Result<JsonResponse<Value>> {
    let collection = transactions(&state);

    let total = collection.count_documents(doc! {}).await?;
    let completed = collection
        .count_documents(doc! { "status": TransactionStatus::Completed.as_str() })
        .await?;
    let failed = collection
        .count_documents(doc! { "status": TransactionStatus::Failed.as_str() })
        .await?;
    let pending = collection
        .count_documents(doc! { "status": TransactionStatus::Pending.as_str() })
        .await?;

    Ok(JsonResponse(json!({
        "total": total,
        "completed": completed,
        "failed": failed,
        "pending": pending,
    })))
}
