//! Core primitives for amqp-autorecovery.
//!
//! This crate provides the building blocks shared by every recovering handle:
//! - [`SuspensionGate`] for parking callers while a link is rebuilt
//! - Event system for observability

pub mod events;
pub mod gate;

pub use events::{ClientEvent, EventListener, EventListeners, FnListener};
pub use gate::{GateError, SuspensionGate};
