// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Definitions of messages passed between the service handle, the I/O loop,
//! and the delivery channel.

use crate::binding::PhysicalAddr;
use crate::Error;
use mctpd_wire::control::EndpointCaps;
use mctpd_wire::Eid;
use tokio::sync::oneshot;

/// A completed inbound message, delivered to the upper layer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InboundMessage {
    /// The endpoint the message came from.
    pub source: Eid,
    /// The message type carried in the first fragment.
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

/// Queryable state for one known physical address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EndpointInfo {
    /// The assigned EID, or `None` if the address was marked unreachable
    /// before discovery completed.
    pub eid: Option<Eid>,
    pub addr: PhysicalAddr,
    pub caps: EndpointCaps,
    pub reachable: bool,
}

/// A request sent from the service handle to the I/O loop.
///
/// Each carries a oneshot sender on which the loop reports the outcome;
/// callers that go away before the reply simply drop the receiving half.
#[derive(Debug)]
pub(crate) enum EngineRequest {
    /// Fragment and transmit a message.
    Submit {
        dest: Eid,
        msg_type: u8,
        payload: Vec<u8>,
        response_tx: oneshot::Sender<Result<(), Error>>,
    },

    /// Begin (or restart) discovery of a physical address.
    Discover {
        addr: PhysicalAddr,
        response_tx: oneshot::Sender<Result<(), Error>>,
    },

    /// Snapshot the endpoint table.
    Endpoints {
        response_tx: oneshot::Sender<Vec<EndpointInfo>>,
    },

    /// Tear down the binding, then exit the loop. The reply is sent after
    /// the binding has been destroyed.
    Shutdown { response_tx: oneshot::Sender<()> },
}
