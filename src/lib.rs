#![no_std]

//! Transport-agnostic Modbus server (slave) engine.
//!
//! This crate parses framed Modbus ADUs (RTU, ASCII or TCP), dispatches the
//! contained PDU against a user-declared [`model`] of coils, discrete
//! inputs, holding registers, input registers and file records, and emits
//! the wire-format reply. It performs no dynamic allocation and keeps all
//! mutable state inside a single [`Instance`], so any number of instances
//! may run side by side.
//!
//! The engine never touches a byte transport itself: the host is
//! responsible for framing a complete ADU into a buffer and for sending
//! the buffer this crate produces in return.

#[cfg(feature = "std")]
extern crate std;

#[cfg(feature = "log")]
#[macro_use]
extern crate log;

#[cfg(any(feature = "rtu", feature = "ascii", feature = "tcp"))]
pub mod codec;
mod error;
mod frame;
mod instance;
mod model;
mod pdu;

pub use error::*;
pub use frame::*;
pub use instance::*;
pub use model::*;
pub use pdu::*;
