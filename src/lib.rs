pub mod api;
pub mod broker;
pub mod config;
pub mod manager;
pub mod metrics;
pub mod protocol;
pub mod pty;
pub mod session;
pub mod transcript;
