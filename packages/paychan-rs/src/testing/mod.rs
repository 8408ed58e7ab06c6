//! Testing utilities: an in-memory mock ledger implementing the adapter
//! contract, for integration tests that exercise the channel manager
//! without RPC infrastructure.

pub mod mock_ledger;

pub use mock_ledger::{MockLedger, MockLedgerState};
