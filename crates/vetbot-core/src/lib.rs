//! Core domain + application logic for the vetting bot.
//!
//! This crate is intentionally framework-agnostic. The chat network and the
//! persistence backend live behind ports (traits); adapter crates implement
//! the gateway side.
//!
//! ```text
//! gateway ─► normalizer ─► machine ◄─► store
//!                            │  ▲
//!                   intents  ▼  │ TimerFired
//!                 gateway / scheduler
//! ```

pub mod commands;
pub mod config;
pub mod decision;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod formatting;
pub mod logging;
pub mod machine;
pub mod messaging;
pub mod normalizer;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod utils;

pub use errors::{Error, Result};
