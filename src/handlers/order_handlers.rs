// handlers/order_handlers.rs
use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use bson::{doc, oid::ObjectId};
use futures_util::TryStreamExt;
use mongodb::Collection;
use tracing::info;

use crate::errors::{AppError, Result};
use crate::events::EventKind;
use crate::models::order::{CreateOrder, Order, OrderStatus, UpdateOrderStatus};
use crate::state::AppState;

fn orders(state: &AppState) -> Collection<Order> {
    state.db.collection("orders")
}

// POST /api/orders
pub async fn create_order(
    State(state): State<AppState>,
    Json(payload): Json<CreateOrder>,
) -> Result<Json<Order>> {
    if payload.user_id.trim().is_empty() {
        return Err(AppError::invalid_data("user_id is required"));
    }
    if payload.items.is_empty() {
        return Err(AppError::invalid_data("order must contain at least one item"));
    }
    if payload.phone_number.trim().is_empty() {
        return Err(AppError::invalid_data("phone_number is required"));
    }
    if payload.delivery_address.trim().is_empty() {
        return Err(AppError::invalid_data("delivery_address is required"));
    }
    if payload.total_price <= 0.0 {
        return Err(AppError::invalid_data("total_price must be greater than 0"));
    }

    let order = Order {
        id: Some(ObjectId::new()),
        user_id: payload.user_id,
        items: payload.items,
        total_price: payload.total_price,
        phone_number: payload.phone_number,
        delivery_address: payload.delivery_address,
        status: OrderStatus::Pending,
        transaction_id: None,
        created_at: Utc::now(),
    };

    orders(&state).insert_one(&order).await?;
    info!(
        "Created order {} for user {} (KSh {})",
        order.id.map(|id| id.to_hex()).unwrap_or_default(),
        order.user_id,
        order.total_price
    );

    state.events.publish_order(EventKind::Inserted, order.clone());

    Ok(Json(order))
}

// GET /api/orders/:id
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Order>> {
    let oid = ObjectId::parse_str(&id)?;

    let order = orders(&state)
        .find_one(doc! { "_id": oid })
        .await?
        .ok_or(AppError::OrderNotFound)?;

    Ok(Json(order))
}

// GET /api/orders/user/:user_id
pub async fn get_user_orders(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Order>>> {
    let cursor = orders(&state).find(doc! { "user_id": &user_id }).await?;
    let mut results: Vec<Order> = cursor.try_collect().await?;

    results.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    Ok(Json(results))
}

// PUT /api/orders/:id/status
//
// Back-office fulfilment updates. `paid` is rejected outright here; payment
// confirmation is the callback receiver's job alone.
pub async fn update_order_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateOrderStatus>,
) -> Result<Json<Order>> {
    let oid = ObjectId::parse_str(&id)?;
    let collection = orders(&state);

    let order = collection
        .find_one(doc! { "_id": oid })
        .await?
        .ok_or(AppError::OrderNotFound)?;

    if payload.status == OrderStatus::Paid {
        return Err(AppError::InvalidStatusTransition(
            "orders are marked paid by payment confirmation only".to_string(),
        ));
    }

    if !order.status.can_transition_to(payload.status) {
        return Err(AppError::InvalidStatusTransition(format!(
            "cannot move order from {} to {}",
            order.status.as_str(),
            payload.status.as_str()
        )));
    }

    collection
        .update_one(
            doc! { "_id": oid },
            doc! { "$set": { "status": payload.status.as_str() } },
        )
        .await?;

    let updated = collection
        .find_one(doc! { "_id": oid })
        .await?
        .ok_or(AppError::OrderNotFound)?;

    info!(
        "Order {} moved from {} to {}",
        id,
        order.status.as_str(),
        updated.status.as_str()
    );

    state.events.publish_order(EventKind::Updated, updated.clone());

    Ok(Json(updated))
}
