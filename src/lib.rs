pub mod config;
pub mod database;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod models;
pub mod monitor;
pub mod routes;
pub mod services;
pub mod state;
pub mod sweeper;
