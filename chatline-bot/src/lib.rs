//! chatline-bot: a small host for the chatline SDK.
//!
//! Keeps one channel session alive, answers a couple of chat commands and
//! sends whispers through the quota-aware queue.

pub mod config;
pub mod router;
