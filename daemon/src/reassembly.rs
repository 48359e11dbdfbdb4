// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-peer reassembly state machine.
//!
//! Each in-progress multi-packet message has one context, keyed by the
//! source EID and the message tag. A context is created by a
//! start-of-message packet, extended by continuations with the expected
//! sequence number, and destroyed on completion, on any invalidating packet,
//! or by the periodic sweep once its deadline passes. At most one context
//! exists per (peer, tag) pair, so a stalled or hostile peer can hold at
//! most eight partially-filled buffers.

use mctpd_wire::packet::PacketHeader;
use mctpd_wire::packet::SeqNum;
use mctpd_wire::Eid;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Why a packet (and possibly its context) was discarded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum DropReason {
    /// A start-of-message packet with no room for the message-type byte.
    EmptyStart,
    /// A continuation packet with no context in progress.
    NoContext,
    /// A sequence gap or duplicate; the context is invalidated.
    SeqMismatch { expected: u8, actual: u8 },
    /// The message grew past the configured bound; the context is
    /// invalidated.
    TooLarge { len: usize, max: usize },
}

/// The outcome of feeding one packet into the table.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Outcome {
    /// The packet completed a message.
    Complete { msg_type: u8, payload: Vec<u8> },
    /// The packet was absorbed; more are expected.
    InProgress,
    /// The packet was discarded.
    Dropped(DropReason),
}

#[derive(Debug)]
struct Context {
    msg_type: u8,
    buf: Vec<u8>,
    next_seq: SeqNum,
    deadline: Instant,
}

/// All in-progress reassemblies.
#[derive(Debug)]
pub(crate) struct ReassemblyTable {
    contexts: HashMap<(Eid, u8), Context>,
    deadline: Duration,
    max_message_size: usize,
}

impl ReassemblyTable {
    pub fn new(deadline: Duration, max_message_size: usize) -> Self {
        Self {
            contexts: HashMap::new(),
            deadline,
            max_message_size,
        }
    }

    /// Feed one validated packet from `src` into the table.
    pub fn handle(
        &mut self,
        src: Eid,
        header: &PacketHeader,
        payload: &[u8],
        now: Instant,
    ) -> Outcome {
        let key = (src, header.tag.value());
        if header.som {
            // A fresh start evicts any stale context for the same peer and
            // tag.
            self.contexts.remove(&key);
            let Some((msg_type, rest)) = payload.split_first() else {
                return Outcome::Dropped(DropReason::EmptyStart);
            };
            if header.eom {
                return Outcome::Complete {
                    msg_type: *msg_type,
                    payload: rest.to_vec(),
                };
            }
            self.contexts.insert(
                key,
                Context {
                    msg_type: *msg_type,
                    buf: rest.to_vec(),
                    next_seq: header.seq.next(),
                    deadline: now + self.deadline,
                },
            );
            return Outcome::InProgress;
        }

        let Some(context) = self.contexts.get_mut(&key) else {
            return Outcome::Dropped(DropReason::NoContext);
        };
        if header.seq != context.next_seq {
            let expected = context.next_seq.value();
            self.contexts.remove(&key);
            return Outcome::Dropped(DropReason::SeqMismatch {
                expected,
                actual: header.seq.value(),
            });
        }
        if context.buf.len() + payload.len() > self.max_message_size {
            let len = context.buf.len() + payload.len();
            self.contexts.remove(&key);
            return Outcome::Dropped(DropReason::TooLarge {
                len,
                max: self.max_message_size,
            });
        }
        context.buf.extend_from_slice(payload);
        context.next_seq = header.seq.next();
        context.deadline = now + self.deadline;
        if header.eom {
            let context = self
                .contexts
                .remove(&key)
                .expect("context present, checked above");
            return Outcome::Complete {
                msg_type: context.msg_type,
                payload: context.buf,
            };
        }
        Outcome::InProgress
    }

    /// Evict every context whose deadline has passed, returning how many
    /// were dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.contexts.len();
        self.contexts.retain(|_, context| context.deadline > now);
        before - self.contexts.len()
    }

    /// Discard all state for a departed peer.
    pub fn drop_peer(&mut self, eid: Eid) {
        self.contexts.retain(|(src, _), _| *src != eid);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }
}
