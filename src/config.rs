// config.rs
use dotenvy::dotenv;
use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mpesa_consumer_key: String,
    pub mpesa_consumer_secret: String,
    pub mpesa_short_code: String,
    pub mpesa_passkey: String,
    pub mpesa_callback_url: String,
    pub mpesa_environment: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        dotenv().ok();

        let mpesa_environment =
            env::var("MPESA_ENVIRONMENT").unwrap_or_else(|_| "sandbox".to_string());

        AppConfig {
            mpesa_consumer_key: env::var("MPESA_CONSUMER_KEY")
                .expect("MPESA_CONSUMER_KEY must be set"),
            mpesa_consumer_secret: env::var("MPESA_CONSUMER_SECRET")
                .expect("MPESA_CONSUMER_SECRET must be set"),
            mpesa_short_code: env::var("MPESA_SHORT_CODE")
                .expect("MPESA_SHORT_CODE must be set"),
            mpesa_passkey: env::var("MPESA_PASSKEY")
                .expect("MPESA_PASSKEY must be set"),
            mpesa_callback_url: env::var("MPESA_CALLBACK_URL")
                .expect("MPESA_CALLBACK_URL must be set"),
            mpesa_environment,
        }
    }

    pub fn is_production(&self) -> bool {
        self.mpesa_environment == "production"
    }

    /// Returns (oauth_url, stk_push_url) for the configured environment.
    pub fn get_mpesa_urls(&self) -> (String, String) {
        let base_url = if self.is_production() {
            "https://api.safaricom.co.ke"
        } else {
            "https://sandbox.safaricom.co.ke"
        };

        let auth_url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            base_url
        );
        let stk_url = format!("{}/mpesa/stkpush/v1/processrequest", base_url);

        (auth_url, stk_url)
    }
}
