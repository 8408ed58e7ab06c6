//! EVM-family ledger adapter: channel contract bindings, transaction
//! client and event watcher.

pub mod client;
pub mod contracts;
pub mod watcher;

pub use client::{EvmChannelClient, EvmChannelConfig};
pub use watcher::EvmChannelWatcher;
