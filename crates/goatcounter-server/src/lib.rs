pub mod app;
pub mod auth;
pub mod bgrun;
pub mod bot_detection;
pub mod buffer;
pub mod config;
pub mod cron;
pub mod error;
pub mod geo;
pub mod memstore;
pub mod ratelimit;
pub mod routes;
pub mod state;
