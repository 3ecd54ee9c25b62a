pub mod events_handlers;
pub mod order_handlers;
pub mod payment_handlers;
