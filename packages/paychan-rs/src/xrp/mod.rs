//! XRP Ledger adapter: PayChannel client over rippled JSON-RPC and the
//! address/identifier helpers the PayChannel primitives need.

pub mod client;

pub use client::{
    compute_channel_id, decode_classic_address, ripple_to_unix, XrpChannelClient, XrpChannelConfig,
};
