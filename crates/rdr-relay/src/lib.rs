//! Relay service: owns one authenticated chat-network session per registered
//! user, supervises connection health, drives the registration handshake and
//! delivers drafted replies back through the right session.

pub mod registration;
pub mod registry;
pub mod service;
pub mod session;
pub mod watchdog;
