// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The control-message codec.
//!
//! Control messages carry the discovery exchange: assigning an endpoint ID
//! to a newly attached device and querying which message types it supports.
//! They travel as ordinary messages with message type
//! [`crate::MSG_TYPE_CONTROL`], whose body is a two-byte control header
//! followed by command-specific fields:
//!
//! | byte | content |
//! |------|---------|
//! | 0    | request flag (bit 7), reserved (bits 6:5, must be zero), instance ID (bits 4:0) |
//! | 1    | command code |
//!
//! The instance ID matches a response to the request that prompted it.

use crate::Eid;

const RQ_BIT: u8 = 0b1000_0000;
const RESERVED_MASK: u8 = 0b0110_0000;
const INSTANCE_ID_MASK: u8 = 0b0001_1111;

/// The number of distinct instance IDs.
pub const INSTANCE_ID_COUNT: u8 = 32;

/// The size of the control header, in bytes.
pub const CONTROL_HEADER_LEN: usize = 2;

/// The most message types a support response may list.
pub const MAX_MESSAGE_TYPES: usize = 16;

/// An error validating a control-message body.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ControlError {
    #[error("control body truncated at {len} bytes")]
    Truncated { len: usize },

    #[error("reserved bits set in control header")]
    ReservedBits,

    #[error("unknown command code 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("unknown completion code 0x{0:02x}")]
    UnknownCompletion(u8),

    #[error("invalid field value 0x{0:02x}")]
    InvalidField(u8),

    #[error("support response lists {0} message types, more than the allowed {MAX_MESSAGE_TYPES}")]
    TooManyTypes(usize),
}

/// A control command code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Command {
    SetEndpointId = 0x01,
    GetEndpointId = 0x02,
    GetMessageTypeSupport = 0x05,
}

impl Command {
    pub fn from_u8(value: u8) -> Result<Self, ControlError> {
        match value {
            0x01 => Ok(Command::SetEndpointId),
            0x02 => Ok(Command::GetEndpointId),
            0x05 => Ok(Command::GetMessageTypeSupport),
            other => Err(ControlError::UnknownCommand(other)),
        }
    }
}

/// The completion code leading every control response body.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum CompletionCode {
    Success = 0x00,
    Error = 0x01,
    InvalidData = 0x02,
    UnsupportedCommand = 0x05,
}

impl CompletionCode {
    pub fn from_u8(value: u8) -> Result<Self, ControlError> {
        match value {
            0x00 => Ok(CompletionCode::Success),
            0x01 => Ok(CompletionCode::Error),
            0x02 => Ok(CompletionCode::InvalidData),
            0x05 => Ok(CompletionCode::UnsupportedCommand),
            other => Err(ControlError::UnknownCompletion(other)),
        }
    }
}

/// The two-byte header of every control message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ControlHeader {
    /// True for requests, false for responses.
    pub request: bool,
    /// Matches a response to its request. 5 bits.
    pub instance_id: u8,
    pub command: Command,
}

impl ControlHeader {
    pub fn encode(&self) -> [u8; CONTROL_HEADER_LEN] {
        let mut b0 = self.instance_id & INSTANCE_ID_MASK;
        if self.request {
            b0 |= RQ_BIT;
        }
        [b0, self.command as u8]
    }

    /// Decode a control header from the front of `buf`, returning it along
    /// with the command-specific remainder.
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), ControlError> {
        if buf.len() < CONTROL_HEADER_LEN {
            return Err(ControlError::Truncated { len: buf.len() });
        }
        if buf[0] & RESERVED_MASK != 0 {
            return Err(ControlError::ReservedBits);
        }
        let header = ControlHeader {
            request: buf[0] & RQ_BIT != 0,
            instance_id: buf[0] & INSTANCE_ID_MASK,
            command: Command::from_u8(buf[1])?,
        };
        Ok((header, &buf[CONTROL_HEADER_LEN..]))
    }
}

// The operation field of a Set Endpoint ID request. Only the plain "set"
// operation is used here; the other values are reserved.
const SET_EID_OP_SET: u8 = 0x00;

/// A request to assign an endpoint ID to the receiving device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SetEndpointIdRequest {
    /// The EID the receiver should adopt.
    pub eid: Eid,
}

impl SetEndpointIdRequest {
    pub fn encode(&self) -> [u8; 2] {
        [SET_EID_OP_SET, self.eid.0]
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        if buf.len() < 2 {
            return Err(ControlError::Truncated { len: buf.len() });
        }
        if buf[0] != SET_EID_OP_SET {
            return Err(ControlError::InvalidField(buf[0]));
        }
        Ok(SetEndpointIdRequest { eid: Eid(buf[1]) })
    }
}

/// The response to a [`SetEndpointIdRequest`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SetEndpointIdResponse {
    pub completion: CompletionCode,
    /// The EID the device actually adopted.
    pub eid: Eid,
}

impl SetEndpointIdResponse {
    pub fn encode(&self) -> [u8; 2] {
        [self.completion as u8, self.eid.0]
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        if buf.len() < 2 {
            return Err(ControlError::Truncated { len: buf.len() });
        }
        Ok(SetEndpointIdResponse {
            completion: CompletionCode::from_u8(buf[0])?,
            eid: Eid(buf[1]),
        })
    }
}

/// The response to a Get Endpoint ID request. The request itself has no
/// body.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GetEndpointIdResponse {
    pub completion: CompletionCode,
    pub eid: Eid,
}

impl GetEndpointIdResponse {
    pub fn encode(&self) -> [u8; 2] {
        [self.completion as u8, self.eid.0]
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        if buf.len() < 2 {
            return Err(ControlError::Truncated { len: buf.len() });
        }
        Ok(GetEndpointIdResponse {
            completion: CompletionCode::from_u8(buf[0])?,
            eid: Eid(buf[1]),
        })
    }
}

/// The response to a Get Message Type Support request, listing the message
/// types the device can receive. The request itself has no body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageTypeSupportResponse {
    pub completion: CompletionCode,
    pub types: Vec<u8>,
}

impl MessageTypeSupportResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.types.len());
        out.push(self.completion as u8);
        out.push(self.types.len() as u8);
        out.extend_from_slice(&self.types);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ControlError> {
        if buf.len() < 2 {
            return Err(ControlError::Truncated { len: buf.len() });
        }
        let completion = CompletionCode::from_u8(buf[0])?;
        let count = usize::from(buf[1]);
        if count > MAX_MESSAGE_TYPES {
            return Err(ControlError::TooManyTypes(count));
        }
        let types = &buf[2..];
        if types.len() < count {
            return Err(ControlError::Truncated { len: buf.len() });
        }
        Ok(MessageTypeSupportResponse {
            completion,
            types: types[..count].to_vec(),
        })
    }
}

bitflags::bitflags! {
    /// Capability flags for a discovered endpoint, derived from the message
    /// types it reports supporting.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct EndpointCaps: u8 {
        /// The endpoint answers control messages.
        const CONTROL   = 0b0000_0001;
        /// Platform-level data model messages.
        const PLDM      = 0b0000_0010;
        /// NC-SI pass-through.
        const NCSI      = 0b0000_0100;
        /// Ethernet pass-through.
        const ETHERNET  = 0b0000_1000;
        /// NVMe management interface.
        const NVME_MI   = 0b0001_0000;
        /// A vendor-defined message space.
        const VENDOR    = 0b0010_0000;
    }
}

impl EndpointCaps {
    /// Derive capability flags from a list of supported message types.
    /// Unrecognized types are ignored.
    pub fn from_types(types: &[u8]) -> Self {
        let mut caps = EndpointCaps::empty();
        for ty in types {
            caps |= match ty {
                0x00 => EndpointCaps::CONTROL,
                0x01 => EndpointCaps::PLDM,
                0x02 => EndpointCaps::NCSI,
                0x03 => EndpointCaps::ETHERNET,
                0x04 => EndpointCaps::NVME_MI,
                0x7E | 0x7F => EndpointCaps::VENDOR,
                _ => EndpointCaps::empty(),
            };
        }
        caps
    }
}
