//! Escrow lifecycle engine.
//!
//! Moves a payment from a detected fiat deposit, through on-chain custody in
//! an escrow contract, to release and fiat payout.  High-value movements are
//! gated by multi-signature approval, and a safety service recovers payments
//! whose escrow provisioning failed part-way.

pub mod api;
pub mod bank;
pub mod chain;
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod models;
pub mod multisig;
pub mod rates;
pub mod router;
pub mod safety;
pub mod scheduler;
pub mod stages;
