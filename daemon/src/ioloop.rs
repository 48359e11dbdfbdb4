// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The main I/O loop of the daemon.
//!
//! The loop multiplexes three event sources: input from the binding,
//! requests from the service handle, and a periodic timer that drives the
//! engine's reassembly sweep and discovery retries. Every engine mutation
//! happens on this one task; the packets an operation generates are
//! transmitted before the next event is taken.
//!
//! The loop exits when the service handle asks for shutdown, when every
//! handle is dropped, or when the binding reports an unrecoverable failure.
//! On the shutdown path the binding is destroyed (closing its bus devices)
//! before the acknowledgment is sent.

use crate::binding::Binding;
use crate::binding::BindingInput;
use crate::binding::PhysicalAddr;
use crate::binding::TransmitError;
use crate::config::BindingConfig;
use crate::config::Config;
use crate::engine::Effects;
use crate::engine::Engine;
use crate::engine::Outbound;
use crate::messages::EngineRequest;
use crate::messages::InboundMessage;
use crate::Error;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use slog::Logger;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::interval;
use tokio::time::sleep;
use tokio::time::Instant;
use tokio::time::Interval;
use tokio::time::MissedTickBehavior;

pub(crate) struct IoLoop<B> {
    log: Logger,
    binding: B,
    engine: Engine,
    request_rx: mpsc::Receiver<EngineRequest>,
    delivery_tx: mpsc::Sender<InboundMessage>,
    sweep_timer: Interval,
    transmit_retries: usize,
    transmit_backoff: Duration,
    /// Addresses to probe for endpoints before the first event is taken.
    probe: Vec<PhysicalAddr>,
}

impl<B: Binding> IoLoop<B> {
    pub fn new(
        config: &Config,
        binding: B,
        request_rx: mpsc::Receiver<EngineRequest>,
        delivery_tx: mpsc::Sender<InboundMessage>,
        log: Logger,
    ) -> Self {
        let engine = Engine::new(config, binding.mtu(), log.clone());
        let mut sweep_timer = interval(config.sweep_interval());
        sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // PCIe peers announce themselves on the monitor channel; SMBus has
        // no such channel, so configured addresses are probed at startup.
        let probe = match &config.binding {
            BindingConfig::Smbus(smbus) => smbus
                .probe
                .iter()
                .map(|addr| PhysicalAddr::Smbus(*addr))
                .collect(),
            BindingConfig::Pcie(_) => Vec::new(),
        };
        Self {
            log,
            binding,
            engine,
            request_rx,
            delivery_tx,
            sweep_timer,
            transmit_retries: config.transmit_retries,
            transmit_backoff: config.transmit_backoff(),
            probe,
        }
    }

    pub async fn run(mut self) {
        info!(self.log, "i/o loop running"; "binding" => self.binding.name());
        for addr in std::mem::take(&mut self.probe) {
            match self.engine.begin_discovery(addr, true, Instant::now()) {
                Ok(effects) => self.carry_out(effects).await,
                Err(e) => {
                    warn!(
                        self.log,
                        "cannot probe configured address";
                        "addr" => %addr,
                        "reason" => %e,
                    );
                }
            }
        }
        loop {
            tokio::select! {
                input = self.binding.next_input() => match input {
                    Ok(BindingInput::Packet { addr, bytes }) => {
                        let effects = self.engine.on_packet(addr, &bytes, Instant::now());
                        self.carry_out(effects).await;
                    }
                    Ok(BindingInput::Link(event)) => {
                        let effects = self.engine.link_event(event, Instant::now());
                        self.carry_out(effects).await;
                    }
                    Err(e) => {
                        error!(self.log, "binding failed, exiting"; "reason" => %e);
                        return;
                    }
                },

                request = self.request_rx.recv() => {
                    let Some(request) = request else {
                        debug!(self.log, "all service handles dropped, exiting");
                        return;
                    };
                    if let Some(ack_tx) = self.handle_request(request).await {
                        info!(self.log, "shutting down");
                        drop(self.binding);
                        let _ = ack_tx.send(());
                        return;
                    }
                }

                _ = self.sweep_timer.tick() => {
                    let now = Instant::now();
                    self.engine.sweep(now);
                    let effects = self.engine.discovery_tick(now);
                    self.carry_out(effects).await;
                }
            }
        }
    }

    // Process one request from the service handle, answering on its oneshot.
    // A shutdown request is not answered here; its sender is returned so the
    // caller can tear down the binding first.
    async fn handle_request(&mut self, request: EngineRequest) -> Option<oneshot::Sender<()>> {
        match request {
            EngineRequest::Submit {
                dest,
                msg_type,
                payload,
                response_tx,
            } => {
                let result = match self
                    .engine
                    .submit_outbound(dest, msg_type, &payload, Instant::now())
                {
                    Ok(packets) => self.transmit_all(packets).await,
                    Err(e) => Err(e),
                };
                let _ = response_tx.send(result);
            }
            EngineRequest::Discover { addr, response_tx } => {
                // Success means discovery was initiated; completion shows up
                // in the endpoint table.
                let result = match self.engine.begin_discovery(addr, true, Instant::now()) {
                    Ok(effects) => {
                        self.carry_out(effects).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = response_tx.send(result);
            }
            EngineRequest::Endpoints { response_tx } => {
                let _ = response_tx.send(self.engine.endpoints());
            }
            EngineRequest::Shutdown { response_tx } => return Some(response_tx),
        }
        None
    }

    async fn carry_out(&mut self, effects: Effects) {
        if let Err(e) = self.transmit_all(effects.transmit).await {
            warn!(self.log, "dropping engine-generated packets"; "reason" => %e);
        }
        if let Some(message) = effects.delivered {
            // Never block the packet loop on a slow consumer.
            if let Err(e) = self.delivery_tx.try_send(message) {
                warn!(self.log, "delivery channel full, dropping message"; "reason" => %e);
            }
        }
    }

    async fn transmit_all(&mut self, packets: Vec<Outbound>) -> Result<(), Error> {
        for packet in packets {
            self.transmit_one(&packet).await?;
        }
        Ok(())
    }

    // Transmit one packet, retrying a busy bus up to the configured budget.
    async fn transmit_one(&mut self, packet: &Outbound) -> Result<(), Error> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.binding.transmit(packet.addr, &packet.bytes).await {
                Ok(()) => return Ok(()),
                Err(TransmitError::Busy) => {
                    if attempts > self.transmit_retries {
                        warn!(
                            self.log,
                            "transmit retry budget exhausted";
                            "addr" => %packet.addr,
                            "attempts" => attempts,
                        );
                        return Err(Error::MaxRetries(attempts));
                    }
                    debug!(
                        self.log,
                        "bus busy, retrying transmit";
                        "addr" => %packet.addr,
                        "attempt" => attempts,
                    );
                    sleep(self.transmit_backoff).await;
                }
                Err(e) => return Err(Error::Transmit(e)),
            }
        }
    }
}
