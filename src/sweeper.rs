// sweeper.rs
//
// Reconciliation sweep for attempts the processor never called back about.
// A prompt the customer simply ignored would otherwise sit `pending`
// forever; after the expiry the transaction is marked failed and the order
// stays `pending`, so the customer can retry from order history. Orders are
// never touched here.
use chrono::{DateTime, Duration, Utc};
use futures_util::TryStreamExt;
use mongodb::{
    bson::{self, doc, Document},
    Collection,
};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::errors::Result;
use crate::events::EventKind;
use crate::models::transaction::{Transaction, TransactionStatus};
use crate::state::AppState;

pub const SWEEP_INTERVAL_SECS: u64 = 300;
pub const PENDING_EXPIRY_MINS: i64 = 15;

pub fn is_expired(created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - created_at > Duration::minutes(PENDING_EXPIRY_MINS)
}

/// Filter for expiring one attempt. Re-asserts `pending` so a callback that
/// resolved the attempt between the stale-set find and this update wins the
/// race; the expiry then matches nothing instead of overwriting the true
/// outcome.
pub(crate) fn expiry_filter(checkout_request_id: &str) -> Document {
    doc! {
        "checkout_request_id": checkout_request_id,
        "status": TransactionStatus::Pending.as_str(),
    }
}

pub(crate) fn expiry_update(now: DateTime<Utc>) -> Document {
    doc! {
        "$set": {
            "status": TransactionStatus::Failed.as_str(),
            "result_desc": "Payment request expired",
            "customer_message": "Payment request expired. Please try again.",
            "updated_at": bson::DateTime::from_chrono(now),
        }
    }
}

pub fn spawn(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            match sweep_once(&state).await {
                Ok(0) => {}
                Ok(n) => info!("Reconciliation sweep expired {} stale transactions", n),
                Err(e) => error!("Reconciliation sweep failed: {}", e),
            }
        }
    })
}

pub async fn sweep_once(state: &AppState) -> Result<u64> {
    let collection: Collection<Transaction> = state.db.collection("transactions");
    let cutoff = Utc::now() - Duration::minutes(PENDING_EXPIRY_MINS);

    let filter = doc! {
        "status": TransactionStatus::Pending.as_str(),
        "created_at": { "$lt": bson::DateTime::from_chrono(cutoff) },
    };

    let cursor = collection.find(filter).await?;
    let stale: Vec<Transaction> = cursor.try_collect().await?;

    let mut expired = 0u64;
    for transaction in stale {
        let result = collection
            .update_one(
                expiry_filter(&transaction.checkout_request_id),
                expiry_update(Utc::now()),
            )
            .await?;

        if result.modified_count == 0 {
            // A late callback resolved this attempt after the find above.
            continue;
        }

        if let Some(updated) = collection
            .find_one(doc! { "checkout_request_id": &transaction.checkout_request_id })
            .await?
        {
            state
                .events
                .publish_transaction(EventKind::Updated, updated);
        }

        expired += 1;
    }

    Ok(expired)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_only_matches_still_pending_attempts() {
        // A completed attempt must never be flipped to failed, even when it
        // was in the stale set when the sweep started: the filter re-checks
        // the status at update time.
        let filter = expiry_filter("ws_CO_1");
        assert_eq!(filter.get_str("checkout_request_id").unwrap(), "ws_CO_1");
        assert_eq!(filter.get_str("status").unwrap(), "pending");
    }

    #[test]
    fn expiry_update_marks_the_attempt_failed() {
        let update = expiry_update(Utc::now());
        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get_str("status").unwrap(), "failed");
        assert_eq!(set.get_str("result_desc").unwrap(), "Payment request expired");
    }

    #[test]
    fn pending_attempt_expires_after_the_window() {
        let now = Utc::now();
        assert!(!is_expired(now - Duration::minutes(5), now));
        assert!(!is_expired(now - Duration::minutes(PENDING_EXPIRY_MINS), now));
        assert!(is_expired(
            now - Duration::minutes(PENDING_EXPIRY_MINS + 1),
            now
        ));
    }
}
