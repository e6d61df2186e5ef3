//! Polls Telegram sources, asks a language model whether each message is
//! worth reading, and forwards the keepers to one target chat exactly once.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod llm;
pub mod orchestrator;
pub mod platform;
pub mod poller;
pub mod retry;
pub mod state;
