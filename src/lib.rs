pub mod auth;
pub mod body;
pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod pool;
pub mod relay;
pub mod server;
pub mod tunnel;
