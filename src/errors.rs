// src/errors.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::services::mpesa_service::MpesaError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("MongoDB error: {0}")]
    MongoDB(#[from] mongodb::error::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("A payment request for this phone number is already in progress. Please wait a moment and try again.")]
    TransactionInProgress,

    #[error("M-Pesa error: {message}")]
    Mpesa {
        code: Option<String>,
        message: String,
    },

    #[error("Order not found")]
    OrderNotFound,

    #[error("Transaction not found")]
    TransactionNotFound,

    #[error("Invalid ObjectId: {0}")]
    InvalidObjectId(String),

    #[error("Invalid status transition: {0}")]
    InvalidStatusTransition(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("External API error: {0}")]
    ExternalApi(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::MongoDB(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string()),
            AppError::ValidationError(_) => (StatusCode::BAD_REQUEST, "Validation failed".to_string()),
            AppError::TransactionInProgress => (StatusCode::CONFLICT, "Transaction already in progress".to_string()),
            AppError::Mpesa { .. } => (StatusCode::BAD_GATEWAY, "M-Pesa error".to_string()),
            AppError::OrderNotFound => (StatusCode::NOT_FOUND, "Order not found".to_string()),
            AppError::TransactionNotFound => (StatusCode::NOT_FOUND, "Transaction not found".to_string()),
            AppError::InvalidObjectId(_) => (StatusCode::BAD_REQUEST, "Invalid ID format".to_string()),
            AppError::InvalidStatusTransition(_) => (StatusCode::BAD_REQUEST, "Invalid status transition".to_string()),
            AppError::ServiceUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "Service unavailable".to_string()),
            AppError::ExternalApi(_) => (StatusCode::BAD_GATEWAY, "External API error".to_string()),
        };

        let mut body = json!({
            "error": error_message,
            "details": self.to_string(),
            "success": false,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        // Pass the processor's own error code through untranslated so the
        // client can show the real reason.
        if let AppError::Mpesa { code: Some(code), .. } = &self {
            body["errorCode"] = json!(code);
        }

        (status, Json(body)).into_response()
    }
}

impl From<MpesaError> for AppError {
    fn from(err: MpesaError) -> Self {
        match err {
            MpesaError::PushRejected { code, message } => AppError::Mpesa {
                code: Some(code),
                message,
            },
            other => AppError::Mpesa {
                code: None,
                message: other.to_string(),
            },
        }
    }
}

impl From<mongodb::bson::oid::Error> for AppError {
    fn from(err: mongodb::bson::oid::Error) -> Self {
        AppError::InvalidObjectId(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::ValidationError(format!("JSON parsing error: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::ExternalApi(format!("HTTP request failed: {}", err))
    }
}

// Helper conversion functions
impl AppError {
    pub fn invalid_data(msg: impl Into<String>) -> Self {
        AppError::ValidationError(msg.into())
    }

    pub fn external_api(msg: impl Into<String>) -> Self {
        AppError::ExternalApi(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
