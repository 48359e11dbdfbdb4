// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire-format definitions for the MCTP transport daemon.
//!
//! This crate contains everything needed to speak the packet protocol on the
//! wire: the endpoint-ID type, the bit-exact packet header codec, and the
//! control-message (discovery) codec. It deliberately has no I/O and no async
//! code, so it can be shared by the daemon, test harnesses, and any other
//! tool that needs to produce or inspect packets.

pub mod control;
pub mod packet;

use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// The size of the fixed packet header, in bytes.
pub const HEADER_LEN: usize = 3;

/// The smallest MTU any binding may declare.
///
/// Every MCTP endpoint must be able to carry packets of this payload size, so
/// it is also the default when a binding's configuration does not say
/// otherwise.
pub const BASELINE_MTU: usize = 64;

/// The largest MTU any binding may declare.
pub const MAX_MTU: usize = 1024;

/// The largest possible packet: fixed header plus a maximum-MTU payload.
pub const MAX_PACKET_SIZE: usize = HEADER_LEN + MAX_MTU;

/// The message type of MCTP control messages, carried in the first payload
/// byte of a message's initial fragment.
pub const MSG_TYPE_CONTROL: u8 = 0x00;

/// An MCTP endpoint ID.
///
/// An 8-bit identifier, unique within the local bus segment. The values `0`
/// (null) and `255` (broadcast) are reserved; everything in between is
/// assignable to discovered endpoints.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Eid(pub u8);

impl Eid {
    /// The null EID, used as the destination when addressing an endpoint
    /// which has not yet been assigned an ID.
    pub const NULL: Self = Eid(0x00);

    /// The broadcast EID.
    pub const BROADCAST: Self = Eid(0xFF);

    /// Return true if this EID may be assigned to an endpoint.
    pub const fn is_assignable(&self) -> bool {
        self.0 != Self::NULL.0 && self.0 != Self::BROADCAST.0
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::Eid;

    #[test]
    fn test_eid_reserved_values() {
        assert!(!Eid::NULL.is_assignable());
        assert!(!Eid::BROADCAST.is_assignable());
        for value in 1..=254u8 {
            assert!(Eid(value).is_assignable());
        }
    }
}
