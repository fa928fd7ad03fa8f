//! The broker daemon.
//!
//! This module ties the intake listener, the queue, the spool, and the
//! upstream connector together under one cooperative event loop:
//!
//! - [`server`] - the [`Broker`](server::Broker) struct, its periodic
//!   tick/drain scheduling, and the startup/shutdown lifecycle
//! - [`signals`] - the signal matrix, delivered to the loop as
//!   [`ControlEvent`](signals::ControlEvent)s

pub mod server;
pub mod signals;

pub use server::{Broker, BrokerHandle};
pub use signals::ControlEvent;
