// services/email_service.rs
use reqwest::Client;
use serde_json::json;

use crate::errors::{AppError, Result};

/// Trigger for the transactional email platform. Template rendering and
/// address resolution happen on the platform side; this only fires the
/// payment-receipt event.
#[derive(Clone)]
pub struct EmailService {
    api_url: String,
    api_key: String,
    from: String,
    client: Client,
}

impl EmailService {
    pub fn new(api_url: String, api_key: String, from: String) -> Self {
        Self {
            api_url,
            api_key,
            from,
            client: Client::new(),
        }
    }

    pub fn from_env() -> Option<Self> {
        let api_url = std::env::var("EMAIL_API_URL").ok()?;
        let api_key = std::env::var("EMAIL_API_KEY").ok()?;
        let from = std::env::var("EMAIL_FROM").unwrap_or_else(|_| "orders@soko.shop".to_string());
        Some(Self::new(api_url, api_key, from))
    }

    pub async fn send_payment_receipt(
        &self,
        user_id: &str,
        order_id: &str,
        amount: f64,
        receipt: &str,
    ) -> Result<()> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "from": self.from,
                "user_id": user_id,
                "subject": format!("Payment received for order {}", order_id),
                "text": format!(
                    "We have received your payment of KSh {:.2}. M-Pesa receipt: {}. \
                     Your order is now being prepared for shipping.",
                    amount, receipt
                ),
            }))
            .send()
            .await
            .map_err(|e| AppError::external_api(format!("Email API error: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(AppError::external_api(format!(
                "Email sending failed with status: {}",
                response.status()
            )))
        }
    }
}
