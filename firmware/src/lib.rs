//! Session core of the battery powered LoRa event counter node.
//!
//! The crate is hardware independent. A board support crate implements the
//! traits in [`hal`], wires the sensor and button interrupts to
//! [`wake::WakeFlags`] and calls [`session::Session::step`] from its main loop.
#![cfg_attr(not(test), no_std)]

pub mod context;
pub mod counter;
pub mod hal;
pub mod measurement;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod wake;

#[cfg(test)]
mod mock;

pub use context::NodeContext;
pub use session::{Session, State};
pub use store::{PersistentStore, StoreError};
pub use wake::{WakeCause, WakeFlags};
