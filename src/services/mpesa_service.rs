// services/mpesa_service.rs
use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use chrono::Utc;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::models::transaction::ACCOUNT_REFERENCE_PREFIX;

#[derive(Error, Debug)]
pub enum MpesaError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("M-Pesa auth failed: {status} - {body}")]
    Auth { status: String, body: String },

    #[error("STK push rejected ({code}): {message}")]
    PushRejected { code: String, message: String },

    #[error("Amount must be greater than 0")]
    InvalidAmount,
}

#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub expires_in: String,
}

#[derive(Debug, Serialize)]
pub struct StkPushRequest {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "TransactionType")]
    pub transaction_type: String,
    #[serde(rename = "Amount")]
    pub amount: String,
    #[serde(rename = "PartyA")]
    pub party_a: String,
    #[serde(rename = "PartyB")]
    pub party_b: String,
    #[serde(rename = "PhoneNumber")]
    pub phone_number: String,
    #[serde(rename = "CallBackURL")]
    pub callback_url: String,
    #[serde(rename = "AccountReference")]
    pub account_reference: String,
    #[serde(rename = "TransactionDesc")]
    pub transaction_desc: String,
}

#[derive(Debug, Deserialize)]
pub struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription")]
    pub response_description: String,
    #[serde(rename = "CustomerMessage")]
    pub customer_message: String,
}

/// Error body Daraja returns on a rejected request, e.g. a concurrent
/// transaction for the same subscriber.
#[derive(Debug, Deserialize)]
struct DarajaErrorResponse {
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
}

/// Canonical international-digits form: strip non-digits, swap the local
/// trunk prefix (`0`) for the country code, prepend the country code when
/// it is missing. Idempotent by construction.
pub fn normalize_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();

    if let Some(rest) = digits.strip_prefix('0') {
        format!("254{}", rest)
    } else if digits.starts_with("254") {
        digits
    } else {
        format!("254{}", digits)
    }
}

/// M-Pesa bills whole shillings only; fractional totals round up.
pub fn push_amount(amount: f64) -> u64 {
    amount.ceil() as u64
}

#[derive(Debug, Clone)]
pub struct MpesaService {
    config: AppConfig,
    client: Client,
    cached_token: Arc<RwLock<Option<(String, chrono::DateTime<Utc>)>>>,
}

impl MpesaService {
    pub fn new(config: AppConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        MpesaService {
            config,
            client,
            cached_token: Arc::new(RwLock::new(None)),
        }
    }

    pub fn callback_url(&self) -> &str {
        &self.config.mpesa_callback_url
    }

    fn generate_password(&self, timestamp: &str) -> String {
        let password_string = format!(
            "{}{}{}",
            self.config.mpesa_short_code, self.config.mpesa_passkey, timestamp
        );
        base64.encode(password_string)
    }

    pub async fn get_access_token(&self) -> Result<String, MpesaError> {
        {
            let cached = self.cached_token.read().unwrap();
            if let Some((token, expiry)) = cached.as_ref() {
                if *expiry > Utc::now() + chrono::Duration::minutes(5) {
                    info!("Using cached access token");
                    return Ok(token.clone());
                }
            }
        }

        info!("Requesting new access token");
        let auth_string = format!(
            "{}:{}",
            self.config.mpesa_consumer_key, self.config.mpesa_consumer_secret
        );
        let encoded_auth = base64.encode(auth_string);

        let (auth_url, _) = self.config.get_mpesa_urls();

        let response = self
            .client
            .get(&auth_url)
            .header(header::AUTHORIZATION, format!("Basic {}", encoded_auth))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Failed to get access token: {} - {}", status, body);
            return Err(MpesaError::Auth {
                status: status.to_string(),
                body,
            });
        }

        let auth_response: AuthResponse = response.json().await?;

        {
            let expiry_time = Utc::now() + chrono::Duration::hours(1);
            let mut cached = self.cached_token.write().unwrap();
            *cached = Some((auth_response.access_token.clone(), expiry_time));
        }

        info!("Access token obtained");
        Ok(auth_response.access_token)
    }

    /// Sends the STK push that prompts the customer's phone. Sending only
    /// means the prompt went out; payment is confirmed (or not) later via
    /// the callback endpoint, never here.
    pub async fn initiate_stk_push(
        &self,
        phone_number: &str,
        amount: f64,
        order_id: &str,
    ) -> Result<StkPushResponse, MpesaError> {
        if amount <= 0.0 {
            return Err(MpesaError::InvalidAmount);
        }

        let formatted_phone = normalize_phone(phone_number);
        info!("STK push for {} - KSh {}", formatted_phone, amount);

        let access_token = self.get_access_token().await?;
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let password = self.generate_password(&timestamp);

        let (_, stk_url) = self.config.get_mpesa_urls();

        let stk_request = StkPushRequest {
            business_short_code: self.config.mpesa_short_code.clone(),
            password,
            timestamp,
            transaction_type: "CustomerPayBillOnline".to_string(),
            amount: push_amount(amount).to_string(),
            party_a: formatted_phone.clone(),
            party_b: self.config.mpesa_short_code.clone(),
            phone_number: formatted_phone,
            callback_url: self.config.mpesa_callback_url.clone(),
            account_reference: format!("{}{}", ACCOUNT_REFERENCE_PREFIX, order_id),
            transaction_desc: format!("Payment for order {}", order_id),
        };

        let response = self
            .client
            .post(&stk_url)
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
            .header(header::CONTENT_TYPE, "application/json")
            .json(&stk_request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("STK push failed: {} - {}", status, body);

            let parsed: DarajaErrorResponse =
                serde_json::from_str(&body).unwrap_or(DarajaErrorResponse {
                    error_code: None,
                    error_message: None,
                });
            return Err(MpesaError::PushRejected {
                code: parsed.error_code.unwrap_or_else(|| status.to_string()),
                message: parsed
                    .error_message
                    .unwrap_or_else(|| "STK push request failed".to_string()),
            });
        }

        let stk_response: StkPushResponse = response.json().await?;

        if stk_response.response_code != "0" {
            return Err(MpesaError::PushRejected {
                code: stk_response.response_code,
                message: stk_response.response_description,
            });
        }

        info!("STK push accepted: {}", stk_response.checkout_request_id);
        Ok(stk_response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_handles_all_common_forms() {
        assert_eq!(normalize_phone("0712345678"), "254712345678");
        assert_eq!(normalize_phone("254712345678"), "254712345678");
        assert_eq!(normalize_phone("+254712345678"), "254712345678");
        assert_eq!(normalize_phone("712345678"), "254712345678");
    }

    #[test]
    fn normalize_strips_formatting() {
        assert_eq!(normalize_phone("0712 345 678"), "254712345678");
        assert_eq!(normalize_phone("+254 (712) 345-678"), "254712345678");
    }

    #[test]
    fn normalize_is_idempotent() {
        for input in ["0712345678", "254712345678", "+254712345678", "712345678"] {
            let once = normalize_phone(input);
            assert_eq!(normalize_phone(&once), once);
        }
    }

    #[test]
    fn push_amount_rounds_up_to_whole_shillings() {
        assert_eq!(push_amount(1500.0), 1500);
        assert_eq!(push_amount(1499.01), 1500);
        assert_eq!(push_amount(0.5), 1);
    }

    #[test]
    fn password_is_base64_of_shortcode_passkey_timestamp() {
        let config = AppConfig {
            mpesa_consumer_key: "key".into(),
            mpesa_consumer_secret: "secret".into(),
            mpesa_short_code: "174379".into(),
            mpesa_passkey: "passkey".into(),
            mpesa_callback_url: "https://example.com/api/mpesa/callback".into(),
            mpesa_environment: "sandbox".into(),
        };
        let service = MpesaService::new(config);

        let password = service.generate_password("20240101120000");
        let decoded = base64.decode(password).unwrap();
        assert_eq!(decoded, b"174379passkey20240101120000");
    }
}
