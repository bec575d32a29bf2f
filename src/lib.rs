//! Multi-chain x402 payment facilitator.
//!
//! Verifies and settles HTTP 402 micropayments on behalf of resource
//! servers. Three settlement backends share one engine: ERC-3009
//! authorizations on EVM chains, pre-signed transaction relay on Solana,
//! and pre-signed relay with post-settlement verification on Stacks. A
//! claims subsystem handles refunds for payments that settled incorrectly.

pub mod chain;
pub mod claims;
pub mod config;
pub mod engine;
pub mod facilitator;
pub mod handlers;
pub mod network;
pub mod poller;
pub mod telemetry;
pub mod timestamp;
pub mod types;
pub mod webhook;
