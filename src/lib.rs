// Film Bridge - Library root

pub mod auth;
pub mod bridge;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http_client;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod store;
