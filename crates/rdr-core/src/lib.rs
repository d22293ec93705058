//! Core domain + contracts for the Reader relay and classifier worker.
//!
//! This crate is intentionally transport-agnostic. The chat-network SDK, the
//! message broker and the relational store live behind ports (traits)
//! implemented by adapter crates; `memory` carries the in-process adapters
//! used by tests and the dev harness.

pub mod bus;
pub mod config;
pub mod domain;
pub mod draft;
pub mod errors;
pub mod logging;
pub mod memory;
pub mod net;
pub mod store;

pub use errors::{Error, Result};
