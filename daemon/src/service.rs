// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The public handle onto a running MCTP daemon.
//!
//! [`MctpService::new`] spawns the I/O loop on the current runtime and
//! returns a cloneable handle plus the channel on which completed inbound
//! messages arrive. Every method is a thin request/response exchange with
//! the loop over an internal channel; once the loop has exited, all of them
//! fail with [`Error::Terminated`].

use crate::binding::Binding;
use crate::binding::BindingError;
use crate::binding::BindingInput;
use crate::binding::PhysicalAddr;
use crate::binding::TransmitError;
use crate::config::BindingConfig;
use crate::config::Config;
use crate::hw::DevFrameDriver;
use crate::hw::DevLinkMonitor;
use crate::ioloop::IoLoop;
use crate::messages::EndpointInfo;
use crate::messages::EngineRequest;
use crate::messages::InboundMessage;
use crate::pcie::PcieBinding;
use crate::smbus::SmbusBinding;
use crate::Error;
use crate::NUM_OUTSTANDING_REQUESTS;
use mctpd_wire::Eid;
use slog::info;
use slog::o;
use slog::Logger;
use tokio::fs::File;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

/// The closed set of bindings a daemon may run.
///
/// Exactly one is active per process, chosen from the configuration at
/// startup. An enum rather than a boxed trait object keeps the I/O loop
/// monomorphic and lets the compiler see every binding it might drive.
#[derive(Debug)]
pub enum ActiveBinding {
    Smbus(SmbusBinding<File>),
    Pcie(PcieBinding<DevFrameDriver, DevLinkMonitor>),
}

impl ActiveBinding {
    /// Open the devices named by the binding configuration.
    pub async fn open(config: &BindingConfig, log: &Logger) -> Result<Self, Error> {
        match config {
            BindingConfig::Smbus(smbus) => {
                let log = log.new(o!("binding" => "smbus"));
                Ok(ActiveBinding::Smbus(SmbusBinding::open(smbus, log).await?))
            }
            BindingConfig::Pcie(pcie) => {
                let log = log.new(o!("binding" => "pcie"));
                let driver = DevFrameDriver::open(&pcie.device, log.clone()).await?;
                let monitor = DevLinkMonitor::open(&pcie.monitor_device, log.clone()).await?;
                Ok(ActiveBinding::Pcie(PcieBinding::new(
                    driver, monitor, pcie, log,
                )))
            }
        }
    }
}

impl Binding for ActiveBinding {
    fn name(&self) -> &'static str {
        match self {
            ActiveBinding::Smbus(b) => b.name(),
            ActiveBinding::Pcie(b) => b.name(),
        }
    }

    fn mtu(&self) -> usize {
        match self {
            ActiveBinding::Smbus(b) => b.mtu(),
            ActiveBinding::Pcie(b) => b.mtu(),
        }
    }

    async fn transmit(&mut self, addr: PhysicalAddr, packet: &[u8]) -> Result<(), TransmitError> {
        match self {
            ActiveBinding::Smbus(b) => b.transmit(addr, packet).await,
            ActiveBinding::Pcie(b) => b.transmit(addr, packet).await,
        }
    }

    async fn next_input(&mut self) -> Result<BindingInput, BindingError> {
        match self {
            ActiveBinding::Smbus(b) => b.next_input().await,
            ActiveBinding::Pcie(b) => b.next_input().await,
        }
    }
}

/// A handle for interacting with a running daemon.
#[derive(Clone, Debug)]
pub struct MctpService {
    request_tx: mpsc::Sender<EngineRequest>,
}

impl MctpService {
    /// Spawn the I/O loop over `binding` and return a handle to it, along
    /// with the channel delivering completed inbound messages.
    pub fn new(
        config: &Config,
        binding: ActiveBinding,
        log: Logger,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        info!(
            log,
            "starting MCTP service";
            "service_name" => &config.service_name,
            "own_eid" => %config.own_eid,
            "binding" => binding.name(),
        );
        let (request_tx, request_rx) = mpsc::channel(NUM_OUTSTANDING_REQUESTS);
        let (delivery_tx, delivery_rx) = mpsc::channel(NUM_OUTSTANDING_REQUESTS);
        let ioloop = IoLoop::new(config, binding, request_rx, delivery_tx, log);
        tokio::spawn(ioloop.run());
        (Self { request_tx }, delivery_rx)
    }

    async fn request<T>(
        &self,
        request: EngineRequest,
        response_rx: oneshot::Receiver<T>,
    ) -> Result<T, Error> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| Error::Terminated)?;
        response_rx.await.map_err(|_| Error::Terminated)
    }

    /// Send a message to a discovered endpoint.
    pub async fn submit(&self, dest: Eid, msg_type: u8, payload: Vec<u8>) -> Result<(), Error> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(
            EngineRequest::Submit {
                dest,
                msg_type,
                payload,
                response_tx,
            },
            response_rx,
        )
        .await?
    }

    /// Start (or restart) discovery of a physical address. Success means
    /// the exchange was initiated; watch [`Self::endpoints`] for the result.
    pub async fn discover(&self, addr: PhysicalAddr) -> Result<(), Error> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(EngineRequest::Discover { addr, response_tx }, response_rx)
            .await?
    }

    /// Snapshot the endpoint table.
    pub async fn endpoints(&self) -> Result<Vec<EndpointInfo>, Error> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(EngineRequest::Endpoints { response_tx }, response_rx)
            .await
    }

    /// Stop the I/O loop, closing the bus devices. Returns once teardown
    /// is complete.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(EngineRequest::Shutdown { response_tx }, response_rx)
            .await
    }
}
