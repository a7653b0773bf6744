//! Hybrid payment routing and webhook reconciliation for the barbershop
//! booking platform.

pub mod clock;
pub mod commission;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod fees;
pub mod gateway;
pub mod ingest;
pub mod money;
pub mod normalizer;
pub mod processors;
pub mod reconciler;
pub mod repair;
pub mod router;
pub mod settings;
pub mod store;
pub mod types;
pub mod verifier;
