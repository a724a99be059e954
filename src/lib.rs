//! Driver Points Ledger Library
//!
//! Exposes the ledger core and its REST facade for use by the server
//! binary and integration tests.

pub mod api;
pub mod ledger;
pub mod models;

pub use ledger::LedgerService;
