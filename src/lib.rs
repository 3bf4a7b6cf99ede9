#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

//! USB host stack for the Kinetis K66 USBHS controller (Teensy 3.6)
//!
//! An EHCI transaction engine plus device enumeration, built for
//! interrupt-driven use with no heap: devices, pipes, and transfers live
//! in fixed pools of hardware-shaped descriptors.
//!
//! # Core Components
//!
//! - [`ehci`] - queue heads, transfer descriptors, and controller registers
//! - [`host`] - pools, schedules, and the interrupt-time dispatcher
//! - [`transfer`] - transfer chains and control-request building
//! - [`enumeration`] - the chapter-9 bring-up state machine
//! - [`driver`] - class driver trait and claim protocol
//! - [`hub`] - external hub support (feature `hub`, on by default)
//!
//! # Use
//!
//! Bring the controller up (clocks, PHY, port power), build a
//! [`UsbHost`] around it in static storage, register drivers, then call
//! [`UsbHost::on_interrupt`] from the USB interrupt handler and feed it
//! root-port attach/detach observations. Everything else happens in
//! completion callbacks.

#[cfg(feature = "defmt")]
use defmt as _;

pub mod descriptor;
pub mod device;
pub mod driver;
pub mod ehci;
pub mod enumeration;
pub mod error;
pub mod host;
pub mod pipe;
pub mod pool;
pub mod transfer;

#[cfg(feature = "hub")]
pub mod hub;

#[cfg(test)]
extern crate std;

#[cfg(test)]
pub(crate) mod testutil;

pub use device::{Device, Speed};
pub use driver::{ClaimScope, DeviceDriver};
pub use ehci::{EhciHc, HcOps};
pub use error::{Result, UsbError};
pub use host::{HostCore, HostEvent, UsbHost};
pub use pipe::{Pipe, PipeType};
pub use pool::{DeviceId, PipeId, TransferId};
pub use transfer::{Completion, Direction, SetupPacket};
