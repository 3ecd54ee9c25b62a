pub mod order;
pub mod transaction;
