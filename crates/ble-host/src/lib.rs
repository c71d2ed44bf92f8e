//! BLE host stack for UART-attached Broadcom controllers
//!
//! Implements the protocol layers between a UART driver and the
//! application:
//! - HCI: H4 wire codec, receive framer, command/response rendezvous
//! - GAP: advertising, scanning, connection management
//! - ATT/GATT: attribute database, server and client procedures
//!
//! The platform supplies the UART (`embedded_io::Write` for transmit, a
//! receive interrupt feeding [`UartRx`]) and a millisecond delay
//! (`embedded_hal::delay::DelayNs`); controller firmware is passed to
//! [`BleHost::init`] as a byte slice.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

// Must precede the other modules so the logging macros are in scope.
#[macro_use]
mod fmt;

pub mod att;
pub mod codec;
pub mod framer;
pub mod gap;
pub mod gatt;
pub mod hci;
pub mod host;
pub mod queue;

pub use framer::{RxFramer, RxPacket, UartRx};
pub use gap::{GapError, GapEvent, GapEventCallback};
pub use gatt::{GattError, GattEvent, GattEventCallback};
pub use hci::{ControllerState, HciError, VersionInfo};
pub use host::{BleHost, Connection};
pub use queue::PacketQueue;

/// Bluetooth device address (6 bytes, written most significant first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    /// Create a new Bluetooth address.
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Get the address bytes.
    pub const fn bytes(&self) -> &[u8; 6] {
        &self.0
    }
}
