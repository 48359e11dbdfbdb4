// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The packet header codec.
//!
//! Every packet on the wire starts with a three-byte header:
//!
//! | byte | content |
//! |------|---------|
//! | 0    | destination EID |
//! | 1    | source EID |
//! | 2    | flag byte, see below |
//!
//! The flag byte packs, from the most significant bit down: start-of-message
//! (bit 7), end-of-message (bit 6), packet sequence number (bits 5:4), the
//! tag-owner ("to-request") flag (bit 3), and the message tag (bits 2:0).
//! This layout matches what other MCTP-speaking devices expect, so it must
//! not change.

use crate::Eid;
use crate::HEADER_LEN;
use crate::MAX_MTU;

const SOM_BIT: u8 = 0b1000_0000;
const EOM_BIT: u8 = 0b0100_0000;
const SEQ_MASK: u8 = 0b0011_0000;
const SEQ_SHIFT: u32 = 4;
const TO_BIT: u8 = 0b0000_1000;
const TAG_MASK: u8 = 0b0000_0111;

/// An error validating a packet against the wire format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum PacketError {
    /// The buffer is shorter than the fixed header.
    #[error("packet truncated: {len} bytes is shorter than the {HEADER_LEN}-byte header")]
    Truncated { len: usize },

    /// The payload exceeds the largest MTU any binding may declare.
    #[error("payload of {len} bytes exceeds the maximum MTU of {MAX_MTU}")]
    PayloadTooLarge { len: usize },
}

/// A message tag, a 3-bit value identifying one in-flight message between a
/// pair of endpoints.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Tag(u8);

impl Tag {
    /// The number of distinct tag values.
    pub const COUNT: usize = 8;

    /// Construct a tag, if the value fits in 3 bits.
    pub const fn new(value: u8) -> Option<Self> {
        if value < Self::COUNT as u8 {
            Some(Tag(value))
        } else {
            None
        }
    }

    pub const fn value(&self) -> u8 {
        self.0
    }
}

/// A packet sequence number, cycling modulo 4 within one message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SeqNum(u8);

impl SeqNum {
    pub const ZERO: Self = SeqNum(0);

    /// Construct a sequence number. Values are taken modulo 4.
    pub const fn new(value: u8) -> Self {
        SeqNum(value & 0b11)
    }

    /// The sequence number following this one.
    pub const fn next(&self) -> Self {
        SeqNum(self.0.wrapping_add(1) & 0b11)
    }

    pub const fn value(&self) -> u8 {
        self.0
    }
}

/// The fixed header common to every packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    /// The destination endpoint.
    pub dest: Eid,
    /// The source endpoint.
    pub src: Eid,
    /// Set on the first packet of a message.
    pub som: bool,
    /// Set on the last packet of a message.
    pub eom: bool,
    /// The position of this packet within its message, modulo 4.
    pub seq: SeqNum,
    /// Set when the sender owns the tag, i.e. the message is a request
    /// originated by the source rather than a response.
    pub tag_owner: bool,
    /// The message tag.
    pub tag: Tag,
}

impl PacketHeader {
    /// Encode the header into its three-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut flags = (self.seq.value() << SEQ_SHIFT) | self.tag.value();
        if self.som {
            flags |= SOM_BIT;
        }
        if self.eom {
            flags |= EOM_BIT;
        }
        if self.tag_owner {
            flags |= TO_BIT;
        }
        [self.dest.0, self.src.0, flags]
    }

    /// Decode a header from the front of `buf`, returning it along with the
    /// payload remainder.
    ///
    /// All eight bits of the flag byte are defined, so any bit pattern
    /// decodes; the checks here are the length bounds.
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::Truncated { len: buf.len() });
        }
        let payload = &buf[HEADER_LEN..];
        if payload.len() > MAX_MTU {
            return Err(PacketError::PayloadTooLarge { len: payload.len() });
        }
        let flags = buf[2];
        let header = PacketHeader {
            dest: Eid(buf[0]),
            src: Eid(buf[1]),
            som: flags & SOM_BIT != 0,
            eom: flags & EOM_BIT != 0,
            seq: SeqNum::new((flags & SEQ_MASK) >> SEQ_SHIFT),
            tag_owner: flags & TO_BIT != 0,
            tag: Tag(flags & TAG_MASK),
        };
        Ok((header, payload))
    }
}
