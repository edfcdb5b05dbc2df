//! Relays prediction status changes to push subscribers and signed webhooks.

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod poller;
pub mod push;
pub mod relay;
pub mod replicate;
pub mod retry;
pub mod state_machine;
pub mod ui;
pub mod webhook;

pub use config::RelayConfig;
pub use error::RelayError;
pub use relay::Relay;
