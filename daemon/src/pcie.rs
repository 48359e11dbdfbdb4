// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The PCIe VDM binding.
//!
//! Unlike SMBus, the PCIe transport driver exchanges whole frames, one
//! packet per frame, and reports device arrival and departure on a separate
//! monitor channel. This module defines the two driver-facing traits and
//! the binding that multiplexes them; the `/dev`-backed implementations live
//! in [`crate::hw`], and tests substitute channel-backed fakes.
//!
//! Monitor and data traffic race: a device's first packets may arrive
//! before its attach event, and packets may trail a detach. The engine
//! tolerates both orders, so this binding forwards each side as it comes.

use crate::binding::Binding;
use crate::binding::BindingError;
use crate::binding::BindingInput;
use crate::binding::LinkEvent;
use crate::binding::PhysicalAddr;
use crate::binding::TransmitError;
use crate::config::PcieConfig;
use mctpd_wire::HEADER_LEN;
use slog::trace;
use slog::Logger;

/// A topology change reported by the transport driver, identifying the
/// device by requester ID.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MonitorEvent {
    Attach(u16),
    Detach(u16),
}

/// The data path of the PCIe transport driver.
#[allow(async_fn_in_trait)]
pub trait FrameDriver {
    /// Send one frame to the device with the given requester ID.
    async fn send(&mut self, dest: u16, frame: &[u8]) -> Result<(), TransmitError>;

    /// Receive one frame, returning the sender's requester ID. Must be
    /// cancel-safe.
    async fn recv(&mut self) -> Result<(u16, Vec<u8>), BindingError>;
}

/// The monitor path of the PCIe transport driver.
#[allow(async_fn_in_trait)]
pub trait LinkMonitor {
    /// Wait for the next topology change. Must be cancel-safe.
    async fn next_event(&mut self) -> Result<MonitorEvent, BindingError>;
}

/// The PCIe binding, generic over both driver channels.
#[derive(Debug)]
pub struct PcieBinding<D, M> {
    log: Logger,
    driver: D,
    monitor: M,
    mtu: usize,
}

impl<D: FrameDriver, M: LinkMonitor> PcieBinding<D, M> {
    pub fn new(driver: D, monitor: M, config: &PcieConfig, log: Logger) -> Self {
        Self {
            log,
            driver,
            monitor,
            mtu: config.mtu,
        }
    }
}

impl<D: FrameDriver, M: LinkMonitor> Binding for PcieBinding<D, M> {
    fn name(&self) -> &'static str {
        "pcie"
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn transmit(&mut self, addr: PhysicalAddr, packet: &[u8]) -> Result<(), TransmitError> {
        let PhysicalAddr::Pcie(bdf) = addr else {
            return Err(TransmitError::WrongBus(addr));
        };
        if packet.len() > HEADER_LEN + self.mtu {
            return Err(TransmitError::Oversize { mtu: self.mtu });
        }
        self.driver.send(bdf, packet).await
    }

    async fn next_input(&mut self) -> Result<BindingInput, BindingError> {
        tokio::select! {
            frame = self.driver.recv() => {
                let (src, bytes) = frame?;
                trace!(
                    self.log,
                    "received frame";
                    "src" => format!("0x{src:04x}"),
                    "n_bytes" => bytes.len(),
                );
                Ok(BindingInput::Packet {
                    addr: PhysicalAddr::Pcie(src),
                    bytes,
                })
            }
            event = self.monitor.next_event() => {
                let event = match event? {
                    MonitorEvent::Attach(bdf) => LinkEvent::Attach(PhysicalAddr::Pcie(bdf)),
                    MonitorEvent::Detach(bdf) => LinkEvent::Detach(PhysicalAddr::Pcie(bdf)),
                };
                trace!(self.log, "link event"; "event" => ?event);
                Ok(BindingInput::Link(event))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Binding;
    use super::FrameDriver;
    use super::LinkMonitor;
    use super::MonitorEvent;
    use super::PcieBinding;
    use crate::binding::BindingError;
    use crate::binding::BindingInput;
    use crate::binding::LinkEvent;
    use crate::binding::PhysicalAddr;
    use crate::binding::TransmitError;
    use crate::config::PcieConfig;
    use crate::test_utils;
    use std::path::PathBuf;
    use tokio::sync::mpsc;

    struct FakeDriver {
        sent_tx: mpsc::Sender<(u16, Vec<u8>)>,
        recv_rx: mpsc::Receiver<(u16, Vec<u8>)>,
    }

    impl FrameDriver for FakeDriver {
        async fn send(&mut self, dest: u16, frame: &[u8]) -> Result<(), TransmitError> {
            self.sent_tx
                .send((dest, frame.to_vec()))
                .await
                .map_err(|_| TransmitError::Io(std::io::Error::other("driver gone")))
        }

        async fn recv(&mut self) -> Result<(u16, Vec<u8>), BindingError> {
            self.recv_rx.recv().await.ok_or(BindingError::Closed)
        }
    }

    struct FakeMonitor {
        event_rx: mpsc::Receiver<MonitorEvent>,
    }

    impl LinkMonitor for FakeMonitor {
        async fn next_event(&mut self) -> Result<MonitorEvent, BindingError> {
            self.event_rx.recv().await.ok_or(BindingError::Closed)
        }
    }

    struct Harness {
        binding: PcieBinding<FakeDriver, FakeMonitor>,
        sent_rx: mpsc::Receiver<(u16, Vec<u8>)>,
        recv_tx: mpsc::Sender<(u16, Vec<u8>)>,
        event_tx: mpsc::Sender<MonitorEvent>,
    }

    fn harness() -> Harness {
        let (sent_tx, sent_rx) = mpsc::channel(8);
        let (recv_tx, recv_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(8);
        let config = PcieConfig {
            device: PathBuf::from("/dev/null"),
            monitor_device: PathBuf::from("/dev/null"),
            bdf: 0x0100,
            mtu: 128,
        };
        Harness {
            binding: PcieBinding::new(
                FakeDriver { sent_tx, recv_rx },
                FakeMonitor { event_rx },
                &config,
                test_utils::test_logger(),
            ),
            sent_rx,
            recv_tx,
            event_tx,
        }
    }

    #[tokio::test]
    async fn test_frame_received_as_packet() {
        let mut h = harness();
        h.recv_tx
            .send((0x1f00, vec![0x08, 0x09, 0xC8, 0x01]))
            .await
            .unwrap();
        let input = h.binding.next_input().await.unwrap();
        assert_eq!(
            input,
            BindingInput::Packet {
                addr: PhysicalAddr::Pcie(0x1f00),
                bytes: vec![0x08, 0x09, 0xC8, 0x01],
            }
        );
    }

    #[tokio::test]
    async fn test_monitor_event_forwarded() {
        let mut h = harness();
        h.event_tx.send(MonitorEvent::Attach(0x1f00)).await.unwrap();
        let input = h.binding.next_input().await.unwrap();
        assert_eq!(
            input,
            BindingInput::Link(LinkEvent::Attach(PhysicalAddr::Pcie(0x1f00)))
        );

        h.event_tx.send(MonitorEvent::Detach(0x1f00)).await.unwrap();
        let input = h.binding.next_input().await.unwrap();
        assert_eq!(
            input,
            BindingInput::Link(LinkEvent::Detach(PhysicalAddr::Pcie(0x1f00)))
        );
    }

    #[tokio::test]
    async fn test_data_before_attach_still_delivered() {
        // The driver may deliver a new device's traffic before its attach
        // event; both must come through in arrival order.
        let mut h = harness();
        h.recv_tx
            .send((0x1f00, vec![0x08, 0x09, 0xC8, 0x01]))
            .await
            .unwrap();
        let first = h.binding.next_input().await.unwrap();
        assert!(matches!(first, BindingInput::Packet { .. }));

        h.event_tx.send(MonitorEvent::Attach(0x1f00)).await.unwrap();
        let second = h.binding.next_input().await.unwrap();
        assert!(matches!(second, BindingInput::Link(_)));
    }

    #[tokio::test]
    async fn test_transmit_addresses_frame() {
        let mut h = harness();
        h.binding
            .transmit(PhysicalAddr::Pcie(0x1f00), &[0x09, 0x08, 0xC8, 0x00])
            .await
            .unwrap();
        let (dest, frame) = h.sent_rx.recv().await.unwrap();
        assert_eq!(dest, 0x1f00);
        assert_eq!(frame, vec![0x09, 0x08, 0xC8, 0x00]);
    }

    #[tokio::test]
    async fn test_transmit_rejects_wrong_bus() {
        let mut h = harness();
        let result = h
            .binding
            .transmit(PhysicalAddr::Smbus(0x32), &[0x00])
            .await;
        assert!(matches!(result, Err(TransmitError::WrongBus(_))));
    }

    #[tokio::test]
    async fn test_transmit_rejects_oversize() {
        let mut h = harness();
        let packet = vec![0u8; 3 + 129];
        let result = h
            .binding
            .transmit(PhysicalAddr::Pcie(0x1f00), &packet)
            .await;
        assert!(matches!(result, Err(TransmitError::Oversize { mtu: 128 })));
    }

    #[tokio::test]
    async fn test_driver_closed() {
        let mut h = harness();
        drop(h.recv_tx);
        drop(h.event_tx);
        assert!(matches!(
            h.binding.next_input().await,
            Err(BindingError::Closed)
        ));
    }
}
