//! Inbox Gateway: multi-channel messaging core.

pub mod api;
pub mod auth;
pub mod channels;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod resolver;
pub mod scheduled;
pub mod store;
