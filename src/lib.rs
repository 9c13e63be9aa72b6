pub mod access_log;
pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod id;
pub mod issuer;
pub mod model;
pub mod signals;
pub mod store;
pub mod sweep;
pub mod ticket;
pub mod util;
