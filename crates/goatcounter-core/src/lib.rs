pub mod aggregate;
pub mod bot;
pub mod clean;
pub mod config;
pub mod error;
pub mod hit;
pub mod session;
pub mod site;
pub mod store;
pub mod useragent;
