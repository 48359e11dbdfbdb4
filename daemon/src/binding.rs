// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The contract every physical binding satisfies.
//!
//! A binding adapts one physical bus to the protocol engine: it turns the
//! bus's bytes or frames into whole packets on receive, and packets into
//! bus transmissions on send. It also owns the bus-specific addressing unit,
//! [`PhysicalAddr`]. The engine is generic over this trait; exactly one
//! concrete binding is active per process, chosen by the composition root.

use std::fmt;

/// A bus-specific physical address, the unit a binding routes by.
///
/// Distinct from an EID: the engine maintains the mapping between the two.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PhysicalAddr {
    /// A 7-bit SMBus target address.
    Smbus(u8),
    /// A PCIe requester ID (bus/device/function).
    Pcie(u16),
}

impl fmt::Display for PhysicalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysicalAddr::Smbus(addr) => write!(f, "smbus:0x{addr:02x}"),
            PhysicalAddr::Pcie(bdf) => write!(f, "pcie:0x{bdf:04x}"),
        }
    }
}

/// A topology event reported by a binding's monitor channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkEvent {
    /// A device appeared at the given address.
    Attach(PhysicalAddr),
    /// The device at the given address went away.
    Detach(PhysicalAddr),
}

/// One unit of input a binding hands to the engine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BindingInput {
    /// One whole packet, already delimited by the binding.
    Packet { addr: PhysicalAddr, bytes: Vec<u8> },
    /// A topology change.
    Link(LinkEvent),
}

/// An error transmitting one packet.
#[derive(Debug, thiserror::Error)]
pub enum TransmitError {
    /// The bus is momentarily busy; the engine retries these a bounded
    /// number of times.
    #[error("bus busy")]
    Busy,

    /// The packet does not fit the binding's MTU.
    #[error("packet exceeds the binding MTU of {mtu} bytes")]
    Oversize { mtu: usize },

    /// The address belongs to a different bus than this binding serves.
    #[error("address {0} is not on this bus")]
    WrongBus(PhysicalAddr),

    /// A non-retryable driver failure.
    #[error("driver I/O failed")]
    Io(#[from] std::io::Error),
}

/// An error receiving input from the bus.
#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error("driver I/O failed")]
    Io(#[from] std::io::Error),

    /// The transport driver closed its side; no further input will arrive.
    #[error("transport driver closed")]
    Closed,
}

/// The polymorphic surface of a physical binding.
#[allow(async_fn_in_trait)]
pub trait Binding {
    /// A short name for logging.
    fn name(&self) -> &'static str;

    /// The largest packet payload this binding can carry.
    fn mtu(&self) -> usize;

    /// Hand one packet to the transport driver for transmission to `addr`.
    async fn transmit(&mut self, addr: PhysicalAddr, packet: &[u8]) -> Result<(), TransmitError>;

    /// Wait for the next unit of input from the bus.
    ///
    /// Implementations must be cancel-safe: the engine loop selects over
    /// this alongside its timers and request channel, and may drop the
    /// future between completions without losing buffered input.
    async fn next_input(&mut self) -> Result<BindingInput, BindingError>;
}
