// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An MCTP transport daemon.
//!
//! This crate implements the bus-independent half of the Management
//! Component Transport Protocol: endpoint-ID assignment and routing,
//! fragmentation and reassembly, and endpoint discovery, all driven from a
//! single-threaded I/O loop. One physical [`binding`] is active per process
//! and adapts the protocol engine to a concrete bus: [`smbus`] carries
//! packets over a continuous byte stream, [`pcie`] over discrete frames with
//! a separate link-event monitor.
//!
//! The public surface is [`MctpService`], which owns the I/O loop task and
//! exposes message submission, discovery, and endpoint queries; completed
//! inbound messages are handed to the caller on a channel returned at
//! construction.

pub mod binding;
pub mod config;
mod eids;
mod engine;
pub mod hw;
mod ioloop;
mod messages;
pub mod pcie;
mod reassembly;
mod service;
pub mod smbus;

#[cfg(test)]
pub(crate) mod test_utils;

pub use binding::Binding;
pub use binding::BindingError;
pub use binding::BindingInput;
pub use binding::LinkEvent;
pub use binding::PhysicalAddr;
pub use binding::TransmitError;
pub use config::BindingConfig;
pub use config::BindingKind;
pub use config::Config;
pub use messages::EndpointInfo;
pub use messages::InboundMessage;
pub use service::ActiveBinding;
pub use service::MctpService;

use mctpd_wire::Eid;

/// The number of requests to the engine that may be queued at once.
pub const NUM_OUTSTANDING_REQUESTS: usize = 8;

/// An error from the MCTP service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The destination EID has no routing entry.
    #[error("no route to endpoint {0}")]
    UnknownEndpoint(Eid),

    /// Every assignable endpoint ID is in use.
    #[error("endpoint ID pool exhausted")]
    PoolExhausted,

    /// Every message tag to the destination is in flight.
    #[error("all message tags to endpoint {0} are in flight")]
    TagExhausted(Eid),

    /// The message exceeds the configured maximum size.
    #[error("message of {len} bytes exceeds the maximum of {max}")]
    MessageTooLarge { len: usize, max: usize },

    /// The bus stayed busy through the transmit retry budget.
    #[error("transmit failed after {0} attempts")]
    MaxRetries(usize),

    /// A non-retryable transmit failure.
    #[error("transmit error: {0}")]
    Transmit(#[from] TransmitError),

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An I/O error on a device or socket.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The service has shut down and can accept no further requests.
    #[error("service is shut down")]
    Terminated,
}
