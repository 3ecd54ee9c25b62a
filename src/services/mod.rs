pub mod email_service;
pub mod mpesa_service;
