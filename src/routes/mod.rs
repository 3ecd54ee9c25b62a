pub mod events;
pub mod mpesa;
pub mod orders;
