// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The transport-agnostic protocol engine.
//!
//! The engine owns every piece of MCTP state: the EID pool, the physical
//! address routing table, per-peer message tags, in-progress reassemblies,
//! and the discovery state machine. It performs no I/O itself; each
//! operation returns the packets to transmit and the messages to deliver as
//! an [`Effects`] value, which the I/O loop carries out. All mutation
//! happens from that single loop, so there is no locking anywhere in here.
//!
//! Malformed or unexpected input never produces an error across this
//! boundary: it is dropped, logged at low severity, and the affected
//! reassembly context (if any) is discarded.

use crate::binding::LinkEvent;
use crate::binding::PhysicalAddr;
use crate::config::Config;
use crate::eids::EidPool;
use crate::messages::EndpointInfo;
use crate::messages::InboundMessage;
use crate::reassembly::Outcome;
use crate::reassembly::ReassemblyTable;
use crate::Error;
use mctpd_wire::control::Command;
use mctpd_wire::control::CompletionCode;
use mctpd_wire::control::ControlHeader;
use mctpd_wire::control::EndpointCaps;
use mctpd_wire::control::GetEndpointIdResponse;
use mctpd_wire::control::MessageTypeSupportResponse;
use mctpd_wire::control::SetEndpointIdRequest;
use mctpd_wire::control::SetEndpointIdResponse;
use mctpd_wire::control::CONTROL_HEADER_LEN;
use mctpd_wire::control::INSTANCE_ID_COUNT;
use mctpd_wire::packet::PacketHeader;
use mctpd_wire::packet::SeqNum;
use mctpd_wire::packet::Tag;
use mctpd_wire::Eid;
use mctpd_wire::HEADER_LEN;
use mctpd_wire::MSG_TYPE_CONTROL;
use slog::debug;
use slog::info;
use slog::trace;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;

/// One packet the I/O loop should hand to the binding.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Outbound {
    pub addr: PhysicalAddr,
    pub bytes: Vec<u8>,
}

/// What an engine operation asks the I/O loop to do.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    /// Packets to transmit, in order.
    pub transmit: Vec<Outbound>,
    /// A completed message to deliver upward.
    pub delivered: Option<InboundMessage>,
}

/// A discovered peer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct EndpointRecord {
    eid: Eid,
    addr: PhysicalAddr,
    caps: EndpointCaps,
}

/// The bijective physical-address/EID mapping, plus per-endpoint state.
#[derive(Debug, Default)]
struct RoutingTable {
    by_addr: BTreeMap<PhysicalAddr, Eid>,
    by_eid: BTreeMap<Eid, EndpointRecord>,
}

impl RoutingTable {
    fn insert(&mut self, record: EndpointRecord) {
        self.by_addr.insert(record.addr, record.eid);
        self.by_eid.insert(record.eid, record);
    }

    fn addr_of(&self, eid: Eid) -> Option<PhysicalAddr> {
        self.by_eid.get(&eid).map(|record| record.addr)
    }

    fn eid_of(&self, addr: PhysicalAddr) -> Option<Eid> {
        self.by_addr.get(&addr).copied()
    }

    fn contains_addr(&self, addr: PhysicalAddr) -> bool {
        self.by_addr.contains_key(&addr)
    }

    fn remove_by_addr(&mut self, addr: PhysicalAddr) -> Option<EndpointRecord> {
        let eid = self.by_addr.remove(&addr)?;
        self.by_eid.remove(&eid)
    }

    fn records(&self) -> impl Iterator<Item = &EndpointRecord> + '_ {
        self.by_eid.values()
    }
}

/// The eight message tags usable toward one destination.
///
/// A tag is in flight from allocation until a response carrying it arrives
/// or its deadline passes; only then may it be reused.
#[derive(Debug)]
struct TagSet {
    deadlines: [Option<Instant>; Tag::COUNT],
    next: u8,
}

impl TagSet {
    fn new() -> Self {
        Self {
            deadlines: [None; Tag::COUNT],
            next: 0,
        }
    }

    fn allocate(&mut self, deadline: Instant) -> Option<Tag> {
        for offset in 0..Tag::COUNT as u8 {
            let value = (self.next + offset) % Tag::COUNT as u8;
            let slot = &mut self.deadlines[usize::from(value)];
            if slot.is_none() {
                *slot = Some(deadline);
                self.next = (value + 1) % Tag::COUNT as u8;
                return Tag::new(value);
            }
        }
        None
    }

    fn complete(&mut self, tag: Tag) {
        self.deadlines[usize::from(tag.value())] = None;
    }

    fn sweep(&mut self, now: Instant) {
        for slot in self.deadlines.iter_mut() {
            if slot.is_some_and(|deadline| deadline <= now) {
                *slot = None;
            }
        }
    }
}

/// Where one address stands in the discovery exchange.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DiscoveryPhase {
    /// Waiting for the peer to accept a Set Endpoint ID.
    AssignEid,
    /// EID accepted; waiting for its message-type support list.
    QueryTypes,
}

#[derive(Clone, Copy, Debug)]
struct DiscoverySession {
    phase: DiscoveryPhase,
    /// The EID provisionally allocated to this peer.
    eid: Eid,
    /// Attempts made in the current phase, counting the initial send.
    attempts: u32,
    next_attempt: Instant,
    instance_id: u8,
}

#[derive(Debug)]
pub(crate) struct Engine {
    log: Logger,
    own_eid: Eid,
    mtu: usize,
    max_message_size: usize,
    reassembly_deadline: Duration,
    discovery_attempts: u32,
    discovery_backoff: Duration,
    pool: EidPool,
    routes: RoutingTable,
    tags: BTreeMap<Eid, TagSet>,
    reassembly: ReassemblyTable,
    discovery: BTreeMap<PhysicalAddr, DiscoverySession>,
    /// Addresses whose discovery budget ran out. Cleared by a fresh link
    /// event or an explicit discover request, not by stray packets.
    unreachable: BTreeSet<PhysicalAddr>,
    next_instance_id: u8,
}

impl Engine {
    pub fn new(config: &Config, mtu: usize, log: Logger) -> Self {
        let mut pool = EidPool::new(config.eid_start..=config.eid_end);
        pool.remove(config.own_eid);
        Self {
            log,
            own_eid: config.own_eid,
            mtu,
            max_message_size: config.max_message_size,
            reassembly_deadline: config.reassembly_deadline(),
            discovery_attempts: config.discovery_attempts,
            discovery_backoff: config.discovery_backoff(),
            pool,
            routes: RoutingTable::default(),
            tags: BTreeMap::new(),
            reassembly: ReassemblyTable::new(
                config.reassembly_deadline(),
                config.max_message_size,
            ),
            discovery: BTreeMap::new(),
            unreachable: BTreeSet::new(),
            next_instance_id: 0,
        }
    }

    /// Fragment a message to `dest` into MTU-sized packets.
    ///
    /// Fails without producing any packets if the destination is unknown,
    /// the message too large, or every tag to that peer is in flight.
    pub fn submit_outbound(
        &mut self,
        dest: Eid,
        msg_type: u8,
        payload: &[u8],
        now: Instant,
    ) -> Result<Vec<Outbound>, Error> {
        let Some(addr) = self.routes.addr_of(dest) else {
            return Err(Error::UnknownEndpoint(dest));
        };
        if payload.len() + 1 > self.max_message_size {
            return Err(Error::MessageTooLarge {
                len: payload.len(),
                max: self.max_message_size - 1,
            });
        }
        let deadline = now + self.reassembly_deadline;
        let tag = self
            .tags
            .entry(dest)
            .or_insert_with(TagSet::new)
            .allocate(deadline)
            .ok_or(Error::TagExhausted(dest))?;

        // The message type travels in the first fragment's payload.
        let mut body = Vec::with_capacity(payload.len() + 1);
        body.push(msg_type);
        body.extend_from_slice(payload);
        trace!(
            self.log,
            "fragmenting outbound message";
            "dest" => %dest,
            "msg_type" => msg_type,
            "n_bytes" => payload.len(),
            "tag" => tag.value(),
        );
        Ok(self.fragment(dest, addr, tag, &body))
    }

    fn fragment(&self, dest: Eid, addr: PhysicalAddr, tag: Tag, body: &[u8]) -> Vec<Outbound> {
        let count = body.len().div_ceil(self.mtu);
        let mut out = Vec::with_capacity(count);
        let mut seq = SeqNum::ZERO;
        for (index, chunk) in body.chunks(self.mtu).enumerate() {
            let header = PacketHeader {
                dest,
                src: self.own_eid,
                som: index == 0,
                eom: index == count - 1,
                seq,
                tag_owner: true,
                tag,
            };
            let mut bytes = Vec::with_capacity(HEADER_LEN + chunk.len());
            bytes.extend_from_slice(&header.encode());
            bytes.extend_from_slice(chunk);
            out.push(Outbound { addr, bytes });
            seq = seq.next();
        }
        out
    }

    /// Process one packet delivered by the binding.
    pub fn on_packet(&mut self, addr: PhysicalAddr, bytes: &[u8], now: Instant) -> Effects {
        let mut effects = Effects::default();
        let (header, payload) = match PacketHeader::decode(bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(
                    self.log,
                    "dropping malformed packet";
                    "addr" => %addr,
                    "reason" => %e,
                );
                return effects;
            }
        };
        if payload.len() > self.mtu {
            debug!(
                self.log,
                "dropping packet larger than the binding MTU";
                "addr" => %addr,
                "n_bytes" => payload.len(),
            );
            return effects;
        }
        if header.dest != self.own_eid && header.dest != Eid::BROADCAST {
            trace!(
                self.log,
                "dropping packet addressed elsewhere";
                "addr" => %addr,
                "dest" => %header.dest,
            );
            return effects;
        }

        if self.discovery.contains_key(&addr) {
            return self.on_discovery_packet(addr, &header, payload, now);
        }

        let Some(eid) = self.routes.eid_of(addr) else {
            // A peer we have never discovered. Its traffic cannot be
            // attributed to an endpoint yet, so drop the packet and start
            // discovery instead.
            debug!(
                self.log,
                "packet from unknown physical address";
                "addr" => %addr,
                "src" => %header.src,
            );
            match self.begin_discovery(addr, false, now) {
                Ok(discovery) => return discovery,
                Err(e) => {
                    warn!(
                        self.log,
                        "cannot start discovery";
                        "addr" => %addr,
                        "reason" => %e,
                    );
                    return effects;
                }
            }
        };
        if header.src != eid {
            debug!(
                self.log,
                "source EID does not match routing entry";
                "addr" => %addr,
                "src" => %header.src,
                "expected" => %eid,
            );
            return effects;
        }

        // A response completes the in-flight use of its tag.
        if !header.tag_owner && header.eom {
            if let Some(tags) = self.tags.get_mut(&eid) {
                tags.complete(header.tag);
            }
        }

        match self.reassembly.handle(eid, &header, payload, now) {
            Outcome::Complete { msg_type, payload } => {
                if msg_type == MSG_TYPE_CONTROL {
                    effects.transmit = self.on_control_message(eid, addr, &header, &payload);
                } else {
                    trace!(
                        self.log,
                        "message reassembled";
                        "peer" => %eid,
                        "msg_type" => msg_type,
                        "n_bytes" => payload.len(),
                    );
                    effects.delivered = Some(InboundMessage {
                        source: eid,
                        msg_type,
                        payload,
                    });
                }
            }
            Outcome::InProgress => {}
            Outcome::Dropped(reason) => {
                debug!(
                    self.log,
                    "discarding reassembly input";
                    "peer" => %eid,
                    "reason" => ?reason,
                );
            }
        }
        effects
    }

    // A completed control message from a known endpoint. Requests get an
    // answer; unsolicited responses are ignored.
    fn on_control_message(
        &mut self,
        eid: Eid,
        addr: PhysicalAddr,
        packet: &PacketHeader,
        body: &[u8],
    ) -> Vec<Outbound> {
        let (control, _rest) = match ControlHeader::decode(body) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(
                    self.log,
                    "dropping malformed control message";
                    "peer" => %eid,
                    "reason" => %e,
                );
                return Vec::new();
            }
        };
        if !control.request {
            trace!(
                self.log,
                "ignoring unsolicited control response";
                "peer" => %eid,
                "command" => ?control.command,
            );
            return Vec::new();
        }
        debug!(
            self.log,
            "answering control request";
            "peer" => %eid,
            "command" => ?control.command,
        );
        let response_body = match control.command {
            Command::GetEndpointId => GetEndpointIdResponse {
                completion: CompletionCode::Success,
                eid: self.own_eid,
            }
            .encode()
            .to_vec(),
            Command::GetMessageTypeSupport => MessageTypeSupportResponse {
                completion: CompletionCode::Success,
                types: vec![MSG_TYPE_CONTROL],
            }
            .encode(),
            // EID assignment on this segment is ours; refuse reassignment.
            Command::SetEndpointId => SetEndpointIdResponse {
                completion: CompletionCode::UnsupportedCommand,
                eid: self.own_eid,
            }
            .encode()
            .to_vec(),
        };
        vec![self.control_packet(
            eid,
            addr,
            false,
            control.instance_id,
            control.command,
            packet.tag,
            false,
            &response_body,
        )]
    }

    // A packet from an address with a discovery session in progress. The
    // peer has no stable EID yet, so responses are matched on the physical
    // address and instance ID alone.
    fn on_discovery_packet(
        &mut self,
        addr: PhysicalAddr,
        header: &PacketHeader,
        payload: &[u8],
        now: Instant,
    ) -> Effects {
        let mut effects = Effects::default();
        if !(header.som && header.eom) {
            debug!(
                self.log,
                "dropping multi-packet message during discovery";
                "addr" => %addr,
            );
            return effects;
        }
        let Some((msg_type, body)) = payload.split_first() else {
            return effects;
        };
        if *msg_type != MSG_TYPE_CONTROL {
            debug!(
                self.log,
                "dropping non-control message from undiscovered address";
                "addr" => %addr,
                "msg_type" => *msg_type,
            );
            return effects;
        }
        let (control, rest) = match ControlHeader::decode(body) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(
                    self.log,
                    "dropping malformed control message during discovery";
                    "addr" => %addr,
                    "reason" => %e,
                );
                return effects;
            }
        };
        if control.request {
            debug!(
                self.log,
                "ignoring control request from undiscovered address";
                "addr" => %addr,
            );
            return effects;
        }
        let mut session = self
            .discovery
            .get(&addr)
            .copied()
            .expect("session presence checked by caller");
        if control.instance_id != session.instance_id {
            debug!(
                self.log,
                "control response with stale instance ID";
                "addr" => %addr,
                "instance_id" => control.instance_id,
            );
            return effects;
        }

        match (session.phase, control.command) {
            (DiscoveryPhase::AssignEid, Command::SetEndpointId) => {
                match SetEndpointIdResponse::decode(rest) {
                    Ok(response)
                        if response.completion == CompletionCode::Success
                            && response.eid == session.eid =>
                    {
                        session.phase = DiscoveryPhase::QueryTypes;
                        session.attempts = 1;
                        session.instance_id = self.next_instance_id();
                        session.next_attempt = now + self.discovery_backoff;
                        effects.transmit.push(self.discovery_request(&session, addr));
                        self.discovery.insert(addr, session);
                        debug!(
                            self.log,
                            "EID assigned, querying message types";
                            "addr" => %addr,
                            "eid" => %session.eid,
                        );
                    }
                    Ok(response) => {
                        warn!(
                            self.log,
                            "endpoint rejected EID assignment";
                            "addr" => %addr,
                            "completion" => ?response.completion,
                            "eid" => %response.eid,
                        );
                        self.abandon_discovery(addr);
                    }
                    Err(e) => {
                        debug!(
                            self.log,
                            "malformed Set Endpoint ID response";
                            "addr" => %addr,
                            "reason" => %e,
                        );
                    }
                }
            }
            (DiscoveryPhase::QueryTypes, Command::GetMessageTypeSupport) => {
                match MessageTypeSupportResponse::decode(rest) {
                    Ok(response) => {
                        // A peer that cannot even list its message types is
                        // still an endpoint; record it with empty caps.
                        let caps = if response.completion == CompletionCode::Success {
                            EndpointCaps::from_types(&response.types)
                        } else {
                            EndpointCaps::empty()
                        };
                        self.discovery.remove(&addr);
                        self.routes.insert(EndpointRecord {
                            eid: session.eid,
                            addr,
                            caps,
                        });
                        info!(
                            self.log,
                            "endpoint discovered";
                            "addr" => %addr,
                            "eid" => %session.eid,
                            "caps" => ?caps,
                        );
                    }
                    Err(e) => {
                        debug!(
                            self.log,
                            "malformed message type support response";
                            "addr" => %addr,
                            "reason" => %e,
                        );
                    }
                }
            }
            _ => {
                debug!(
                    self.log,
                    "control response does not match discovery phase";
                    "addr" => %addr,
                    "command" => ?control.command,
                    "phase" => ?session.phase,
                );
            }
        }
        effects
    }

    /// Begin discovery of a physical address, allocating it a provisional
    /// EID and sending the first Set Endpoint ID request.
    ///
    /// `force` restarts discovery for an address previously marked
    /// unreachable; the non-forced form (used for stray packets) leaves it
    /// alone so a dead or hostile peer cannot grind the bus with retries.
    pub fn begin_discovery(
        &mut self,
        addr: PhysicalAddr,
        force: bool,
        now: Instant,
    ) -> Result<Effects, Error> {
        let mut effects = Effects::default();
        if self.routes.contains_addr(addr) || self.discovery.contains_key(&addr) {
            return Ok(effects);
        }
        if self.unreachable.contains(&addr) {
            if !force {
                return Ok(effects);
            }
            self.unreachable.remove(&addr);
        }
        let eid = self.pool.allocate()?;
        let session = DiscoverySession {
            phase: DiscoveryPhase::AssignEid,
            eid,
            attempts: 1,
            next_attempt: now + self.discovery_backoff,
            instance_id: self.next_instance_id(),
        };
        info!(
            self.log,
            "starting endpoint discovery";
            "addr" => %addr,
            "eid" => %eid,
        );
        effects.transmit.push(self.discovery_request(&session, addr));
        self.discovery.insert(addr, session);
        Ok(effects)
    }

    // Build the request packet for a session's current phase. Reused
    // verbatim on retries, including the instance ID.
    fn discovery_request(&self, session: &DiscoverySession, addr: PhysicalAddr) -> Outbound {
        let (dest, command, body) = match session.phase {
            DiscoveryPhase::AssignEid => (
                Eid::NULL,
                Command::SetEndpointId,
                SetEndpointIdRequest { eid: session.eid }.encode().to_vec(),
            ),
            DiscoveryPhase::QueryTypes => {
                (session.eid, Command::GetMessageTypeSupport, Vec::new())
            }
        };
        self.control_packet(
            dest,
            addr,
            true,
            session.instance_id,
            command,
            Tag::new(0).expect("0 is a valid tag"),
            true,
            &body,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn control_packet(
        &self,
        dest: Eid,
        addr: PhysicalAddr,
        request: bool,
        instance_id: u8,
        command: Command,
        tag: Tag,
        tag_owner: bool,
        body: &[u8],
    ) -> Outbound {
        let control = ControlHeader {
            request,
            instance_id,
            command,
        };
        let header = PacketHeader {
            dest,
            src: self.own_eid,
            som: true,
            eom: true,
            seq: SeqNum::ZERO,
            tag_owner,
            tag,
        };
        let mut bytes = Vec::with_capacity(HEADER_LEN + 1 + CONTROL_HEADER_LEN + body.len());
        bytes.extend_from_slice(&header.encode());
        bytes.push(MSG_TYPE_CONTROL);
        bytes.extend_from_slice(&control.encode());
        bytes.extend_from_slice(body);
        Outbound { addr, bytes }
    }

    fn next_instance_id(&mut self) -> u8 {
        let id = self.next_instance_id;
        self.next_instance_id = (id + 1) % INSTANCE_ID_COUNT;
        id
    }

    fn abandon_discovery(&mut self, addr: PhysicalAddr) {
        if let Some(session) = self.discovery.remove(&addr) {
            self.pool.release(session.eid);
            self.unreachable.insert(addr);
            warn!(
                self.log,
                "marking physical address unreachable";
                "addr" => %addr,
                "attempts" => session.attempts,
            );
        }
    }

    /// Retry or abandon discovery sessions whose backoff has elapsed.
    pub fn discovery_tick(&mut self, now: Instant) -> Effects {
        let due: Vec<PhysicalAddr> = self
            .discovery
            .iter()
            .filter(|(_, session)| session.next_attempt <= now)
            .map(|(addr, _)| *addr)
            .collect();
        let mut effects = Effects::default();
        for addr in due {
            let mut session = self
                .discovery
                .get(&addr)
                .copied()
                .expect("session collected above");
            if session.attempts >= self.discovery_attempts {
                self.abandon_discovery(addr);
                continue;
            }
            session.attempts += 1;
            session.next_attempt = now + self.discovery_backoff;
            debug!(
                self.log,
                "retrying discovery";
                "addr" => %addr,
                "attempt" => session.attempts,
                "phase" => ?session.phase,
            );
            effects.transmit.push(self.discovery_request(&session, addr));
            self.discovery.insert(addr, session);
        }
        effects
    }

    /// React to a topology change reported by the binding.
    pub fn link_event(&mut self, event: LinkEvent, now: Instant) -> Effects {
        match event {
            LinkEvent::Attach(addr) => match self.begin_discovery(addr, true, now) {
                Ok(effects) => effects,
                Err(e) => {
                    warn!(
                        self.log,
                        "cannot discover attached device";
                        "addr" => %addr,
                        "reason" => %e,
                    );
                    Effects::default()
                }
            },
            LinkEvent::Detach(addr) => {
                self.unreachable.remove(&addr);
                if let Some(session) = self.discovery.remove(&addr) {
                    self.pool.release(session.eid);
                }
                if let Some(record) = self.routes.remove_by_addr(addr) {
                    self.pool.release(record.eid);
                    self.tags.remove(&record.eid);
                    self.reassembly.drop_peer(record.eid);
                    info!(
                        self.log,
                        "endpoint detached";
                        "addr" => %addr,
                        "eid" => %record.eid,
                    );
                }
                Effects::default()
            }
        }
    }

    /// Expire reassembly contexts and in-flight tags past their deadlines.
    pub fn sweep(&mut self, now: Instant) {
        let evicted = self.reassembly.sweep(now);
        if evicted > 0 {
            debug!(
                self.log,
                "evicted expired reassembly contexts";
                "n_contexts" => evicted,
            );
        }
        for tags in self.tags.values_mut() {
            tags.sweep(now);
        }
    }

    /// Snapshot the endpoint table, including addresses marked unreachable.
    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        let mut out: Vec<EndpointInfo> = self
            .routes
            .records()
            .map(|record| EndpointInfo {
                eid: Some(record.eid),
                addr: record.addr,
                caps: record.caps,
                reachable: true,
            })
            .collect();
        out.extend(self.unreachable.iter().map(|addr| EndpointInfo {
            eid: None,
            addr: *addr,
            caps: EndpointCaps::empty(),
            reachable: false,
        }));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::Engine;
    use crate::binding::LinkEvent;
    use crate::binding::PhysicalAddr;
    use crate::test_utils;
    use crate::Error;
    use mctpd_wire::control::Command;
    use mctpd_wire::control::CompletionCode;
    use mctpd_wire::control::ControlHeader;
    use mctpd_wire::control::MessageTypeSupportResponse;
    use mctpd_wire::control::SetEndpointIdRequest;
    use mctpd_wire::control::SetEndpointIdResponse;
    use mctpd_wire::packet::PacketHeader;
    use mctpd_wire::packet::SeqNum;
    use mctpd_wire::packet::Tag;
    use mctpd_wire::Eid;
    use mctpd_wire::BASELINE_MTU;
    use mctpd_wire::HEADER_LEN;
    use mctpd_wire::MSG_TYPE_CONTROL;
    use tokio::time::Instant;

    const PEER_ADDR: PhysicalAddr = PhysicalAddr::Smbus(0x32);

    fn engine() -> Engine {
        Engine::new(
            &test_utils::test_config(),
            BASELINE_MTU,
            test_utils::test_logger(),
        )
    }

    // Build the peer's single-packet control response to one of our
    // discovery requests.
    fn control_response(
        src: Eid,
        dest: Eid,
        instance_id: u8,
        command: Command,
        body: &[u8],
    ) -> Vec<u8> {
        let header = PacketHeader {
            dest,
            src,
            som: true,
            eom: true,
            seq: SeqNum::ZERO,
            tag_owner: false,
            tag: Tag::new(0).unwrap(),
        };
        let control = ControlHeader {
            request: false,
            instance_id,
            command,
        };
        let mut bytes = header.encode().to_vec();
        bytes.push(MSG_TYPE_CONTROL);
        bytes.extend_from_slice(&control.encode());
        bytes.extend_from_slice(body);
        bytes
    }

    // Walk an engine through the full discovery exchange with a
    // well-behaved fake peer, returning the EID it was assigned.
    fn discover_peer(engine: &mut Engine, addr: PhysicalAddr) -> Eid {
        let now = Instant::now();
        let effects = engine.begin_discovery(addr, true, now).unwrap();
        assert_eq!(effects.transmit.len(), 1);
        let packet = &effects.transmit[0];
        assert_eq!(packet.addr, addr);

        // Parse the Set Endpoint ID request we sent.
        let (header, payload) = PacketHeader::decode(&packet.bytes).unwrap();
        assert_eq!(header.dest, Eid::NULL);
        assert!(header.som && header.eom && header.tag_owner);
        assert_eq!(payload[0], MSG_TYPE_CONTROL);
        let (control, rest) = ControlHeader::decode(&payload[1..]).unwrap();
        assert!(control.request);
        assert_eq!(control.command, Command::SetEndpointId);
        let request = SetEndpointIdRequest::decode(rest).unwrap();
        assert!(request.eid.is_assignable());

        // Accept the assignment.
        let response = SetEndpointIdResponse {
            completion: CompletionCode::Success,
            eid: request.eid,
        };
        let bytes = control_response(
            request.eid,
            header.src,
            control.instance_id,
            Command::SetEndpointId,
            &response.encode(),
        );
        let effects = engine.on_packet(addr, &bytes, now);
        assert_eq!(effects.transmit.len(), 1);

        // Parse and answer the message-type query.
        let (header, payload) = PacketHeader::decode(&effects.transmit[0].bytes).unwrap();
        assert_eq!(header.dest, request.eid);
        let (control, _) = ControlHeader::decode(&payload[1..]).unwrap();
        assert_eq!(control.command, Command::GetMessageTypeSupport);
        let response = MessageTypeSupportResponse {
            completion: CompletionCode::Success,
            types: vec![MSG_TYPE_CONTROL, 0x01],
        };
        let bytes = control_response(
            request.eid,
            header.src,
            control.instance_id,
            Command::GetMessageTypeSupport,
            &response.encode(),
        );
        let effects = engine.on_packet(addr, &bytes, now);
        assert!(effects.transmit.is_empty());
        assert!(effects.delivered.is_none());

        request.eid
    }

    #[test]
    fn test_discovery_exchange() {
        let mut engine = engine();
        let eid = discover_peer(&mut engine, PEER_ADDR);

        let endpoints = engine.endpoints();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].eid, Some(eid));
        assert_eq!(endpoints[0].addr, PEER_ADDR);
        assert!(endpoints[0].reachable);
        assert!(endpoints[0]
            .caps
            .contains(mctpd_wire::control::EndpointCaps::PLDM));
    }

    #[test]
    fn test_submit_to_unknown_endpoint() {
        let mut engine = engine();
        let result = engine.submit_outbound(Eid(42), 0x01, b"hello", Instant::now());
        assert!(matches!(result, Err(Error::UnknownEndpoint(Eid(42)))));
    }

    #[test]
    fn test_fragmentation() {
        let mut engine = engine();
        let eid = discover_peer(&mut engine, PEER_ADDR);

        let payload = vec![0x5A; 160];
        let packets = engine
            .submit_outbound(eid, 0x01, &payload, Instant::now())
            .unwrap();
        // 161 bytes of body over a 64-byte MTU: 64 + 64 + 33.
        assert_eq!(packets.len(), 3);

        let mut reassembled = Vec::new();
        for (index, packet) in packets.iter().enumerate() {
            let (header, chunk) = PacketHeader::decode(&packet.bytes).unwrap();
            assert_eq!(header.dest, eid);
            assert_eq!(header.som, index == 0);
            assert_eq!(header.eom, index == packets.len() - 1);
            assert_eq!(header.seq.value(), index as u8 % 4);
            assert!(header.tag_owner);
            assert!(chunk.len() <= BASELINE_MTU);
            assert_eq!(packet.bytes.len(), HEADER_LEN + chunk.len());
            reassembled.extend_from_slice(chunk);
        }
        assert_eq!(reassembled[0], 0x01);
        assert_eq!(&reassembled[1..], &payload[..]);
    }

    #[test]
    fn test_tag_exhaustion_and_completion() {
        let mut engine = engine();
        let eid = discover_peer(&mut engine, PEER_ADDR);
        let now = Instant::now();

        let mut tags = Vec::new();
        for _ in 0..Tag::COUNT {
            let packets = engine.submit_outbound(eid, 0x01, b"ping", now).unwrap();
            let (header, _) = PacketHeader::decode(&packets[0].bytes).unwrap();
            tags.push(header.tag);
        }
        assert!(matches!(
            engine.submit_outbound(eid, 0x01, b"ping", now),
            Err(Error::TagExhausted(_))
        ));

        // A response from the peer completes the first tag.
        let header = PacketHeader {
            dest: Eid(8),
            src: eid,
            som: true,
            eom: true,
            seq: SeqNum::ZERO,
            tag_owner: false,
            tag: tags[0],
        };
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&[0x01, 0xAA]);
        let effects = engine.on_packet(PEER_ADDR, &bytes, now);
        assert!(effects.delivered.is_some());

        assert!(engine.submit_outbound(eid, 0x01, b"ping", now).is_ok());
    }

    // A peer that never answers must not pin its tags forever; the sweep
    // frees them once their deadline passes.
    #[test]
    fn test_tag_sweep_frees_expired_tags() {
        let mut engine = engine();
        let eid = discover_peer(&mut engine, PEER_ADDR);
        let start = Instant::now();

        for _ in 0..Tag::COUNT {
            engine.submit_outbound(eid, 0x01, b"ping", start).unwrap();
        }
        assert!(matches!(
            engine.submit_outbound(eid, 0x01, b"ping", start),
            Err(Error::TagExhausted(_))
        ));

        let deadline = test_utils::test_config().reassembly_deadline();
        engine.sweep(start + deadline / 2);
        assert!(matches!(
            engine.submit_outbound(eid, 0x01, b"ping", start + deadline / 2),
            Err(Error::TagExhausted(_))
        ));

        engine.sweep(start + deadline);
        assert!(engine
            .submit_outbound(eid, 0x01, b"ping", start + deadline)
            .is_ok());
    }

    #[test]
    fn test_submit_rejects_oversize_message() {
        let mut engine = engine();
        let eid = discover_peer(&mut engine, PEER_ADDR);

        // The message-type byte counts against the bound.
        let payload = vec![0u8; test_utils::test_config().max_message_size];
        assert!(matches!(
            engine.submit_outbound(eid, 0x01, &payload, Instant::now()),
            Err(Error::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_message_delivery() {
        let mut engine = engine();
        let eid = discover_peer(&mut engine, PEER_ADDR);
        let now = Instant::now();

        let header = PacketHeader {
            dest: Eid(8),
            src: eid,
            som: true,
            eom: true,
            seq: SeqNum::ZERO,
            tag_owner: true,
            tag: Tag::new(3).unwrap(),
        };
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&[0x01, 0xDE, 0xAD]);
        let effects = engine.on_packet(PEER_ADDR, &bytes, now);
        let delivered = effects.delivered.unwrap();
        assert_eq!(delivered.source, eid);
        assert_eq!(delivered.msg_type, 0x01);
        assert_eq!(delivered.payload, vec![0xDE, 0xAD]);
    }

    #[test]
    fn test_packet_addressed_elsewhere_dropped() {
        let mut engine = engine();
        let eid = discover_peer(&mut engine, PEER_ADDR);

        let header = PacketHeader {
            dest: Eid(99),
            src: eid,
            som: true,
            eom: true,
            seq: SeqNum::ZERO,
            tag_owner: true,
            tag: Tag::new(0).unwrap(),
        };
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&[0x01, 0xFF]);
        let effects = engine.on_packet(PEER_ADDR, &bytes, Instant::now());
        assert!(effects.delivered.is_none());
        assert!(effects.transmit.is_empty());
    }

    #[test]
    fn test_malformed_packet_dropped() {
        let mut engine = engine();
        let effects = engine.on_packet(PEER_ADDR, &[0x08], Instant::now());
        assert!(effects.delivered.is_none());
        assert!(effects.transmit.is_empty());
    }

    #[test]
    fn test_unknown_source_starts_discovery() {
        let mut engine = engine();
        let header = PacketHeader {
            dest: Eid(8),
            src: Eid(77),
            som: true,
            eom: true,
            seq: SeqNum::ZERO,
            tag_owner: true,
            tag: Tag::new(0).unwrap(),
        };
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&[0x01, 0xFF]);

        let effects = engine.on_packet(PEER_ADDR, &bytes, Instant::now());
        // The packet itself is dropped, but discovery kicks off.
        assert!(effects.delivered.is_none());
        assert_eq!(effects.transmit.len(), 1);
        let (header, payload) = PacketHeader::decode(&effects.transmit[0].bytes).unwrap();
        assert_eq!(header.dest, Eid::NULL);
        assert_eq!(payload[0], MSG_TYPE_CONTROL);
    }

    #[test]
    fn test_discovery_retry_exhaustion() {
        let mut engine = engine();
        let start = Instant::now();
        let backoff = test_utils::test_config().discovery_backoff();

        let effects = engine.begin_discovery(PEER_ADDR, true, start).unwrap();
        assert_eq!(effects.transmit.len(), 1);

        // Two retries follow the initial attempt (budget of three), then
        // the address is marked unreachable.
        let effects = engine.discovery_tick(start + backoff);
        assert_eq!(effects.transmit.len(), 1);
        let effects = engine.discovery_tick(start + backoff * 2);
        assert_eq!(effects.transmit.len(), 1);
        let effects = engine.discovery_tick(start + backoff * 3);
        assert!(effects.transmit.is_empty());

        let endpoints = engine.endpoints();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].eid, None);
        assert!(!endpoints[0].reachable);

        // No further ticks retry it.
        let effects = engine.discovery_tick(start + backoff * 10);
        assert!(effects.transmit.is_empty());

        // A stray packet does not resurrect it either.
        let header = PacketHeader {
            dest: Eid(8),
            src: Eid(77),
            som: true,
            eom: true,
            seq: SeqNum::ZERO,
            tag_owner: true,
            tag: Tag::new(0).unwrap(),
        };
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&[0x01, 0xFF]);
        let effects = engine.on_packet(PEER_ADDR, &bytes, start + backoff * 10);
        assert!(effects.transmit.is_empty());

        // But an explicit (forced) discover starts over.
        let effects = engine
            .begin_discovery(PEER_ADDR, true, start + backoff * 10)
            .unwrap();
        assert_eq!(effects.transmit.len(), 1);
    }

    #[test]
    fn test_detach_releases_endpoint() {
        let mut engine = engine();
        let eid = discover_peer(&mut engine, PEER_ADDR);
        let now = Instant::now();

        engine.link_event(LinkEvent::Detach(PEER_ADDR), now);
        assert!(engine.endpoints().is_empty());
        assert!(matches!(
            engine.submit_outbound(eid, 0x01, b"x", now),
            Err(Error::UnknownEndpoint(_))
        ));

        // The released EID is assigned to the next discovered peer.
        let other = PhysicalAddr::Smbus(0x41);
        let reassigned = discover_peer(&mut engine, other);
        assert_eq!(reassigned, eid);
    }

    #[test]
    fn test_attach_starts_discovery() {
        let mut engine = engine();
        let effects = engine.link_event(LinkEvent::Attach(PEER_ADDR), Instant::now());
        assert_eq!(effects.transmit.len(), 1);
        let (header, _) = PacketHeader::decode(&effects.transmit[0].bytes).unwrap();
        assert_eq!(header.dest, Eid::NULL);
    }

    #[test]
    fn test_control_request_answered() {
        let mut engine = engine();
        let eid = discover_peer(&mut engine, PEER_ADDR);

        let header = PacketHeader {
            dest: Eid(8),
            src: eid,
            som: true,
            eom: true,
            seq: SeqNum::ZERO,
            tag_owner: true,
            tag: Tag::new(4).unwrap(),
        };
        let control = ControlHeader {
            request: true,
            instance_id: 9,
            command: Command::GetEndpointId,
        };
        let mut bytes = header.encode().to_vec();
        bytes.push(MSG_TYPE_CONTROL);
        bytes.extend_from_slice(&control.encode());

        let effects = engine.on_packet(PEER_ADDR, &bytes, Instant::now());
        assert_eq!(effects.transmit.len(), 1);
        let (reply, payload) = PacketHeader::decode(&effects.transmit[0].bytes).unwrap();
        assert_eq!(reply.dest, eid);
        assert_eq!(reply.tag, header.tag);
        assert!(!reply.tag_owner);
        let (control, rest) = ControlHeader::decode(&payload[1..]).unwrap();
        assert!(!control.request);
        assert_eq!(control.instance_id, 9);
        // Our own EID comes back.
        assert_eq!(rest, &[CompletionCode::Success as u8, 8]);
    }
}
