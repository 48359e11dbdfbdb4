// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Character-device implementations of the PCIe driver traits.
//!
//! The transport driver exposes two devices. The data device exchanges one
//! record per read or write: outbound records are `[dest: u16 LE][frame]`,
//! inbound records are `[src: u16 LE][frame]`. The monitor device yields
//! three-byte records, `[event: u8][bdf: u16 LE]`, where event 1 is attach
//! and 0 is detach.
//!
//! `tokio::fs::File` runs each operation on the blocking pool and parks a
//! completed-but-unclaimed result inside the handle, so a read dropped by
//! `select!` is resumed by the next call rather than lost.

use crate::binding::BindingError;
use crate::binding::TransmitError;
use crate::pcie::FrameDriver;
use crate::pcie::LinkMonitor;
use crate::pcie::MonitorEvent;
use mctpd_wire::MAX_PACKET_SIZE;
use slog::debug;
use slog::info;
use slog::Logger;
use std::path::Path;
use tokio::fs::File;
use tokio::fs::OpenOptions;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

/// The requester-ID prefix on every data record.
const ADDR_LEN: usize = 2;

const EVENT_DETACH: u8 = 0;
const EVENT_ATTACH: u8 = 1;

/// The data half of the transport driver.
#[derive(Debug)]
pub struct DevFrameDriver {
    log: Logger,
    file: File,
}

impl DevFrameDriver {
    pub async fn open(path: impl AsRef<Path>, log: Logger) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .await?;
        info!(log, "opened frame device"; "device" => %path.as_ref().display());
        Ok(Self { log, file })
    }
}

impl FrameDriver for DevFrameDriver {
    async fn send(&mut self, dest: u16, frame: &[u8]) -> Result<(), TransmitError> {
        let mut record = Vec::with_capacity(ADDR_LEN + frame.len());
        record.extend_from_slice(&dest.to_le_bytes());
        record.extend_from_slice(frame);
        match self.file.write_all(&record).await {
            Ok(()) => {
                self.file.flush().await?;
                Ok(())
            }
            // The driver reports a full transmit queue as EAGAIN.
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(TransmitError::Busy),
            Err(e) => Err(TransmitError::Io(e)),
        }
    }

    async fn recv(&mut self) -> Result<(u16, Vec<u8>), BindingError> {
        loop {
            let mut record = vec![0u8; ADDR_LEN + MAX_PACKET_SIZE];
            let n = self.file.read(&mut record).await?;
            if n == 0 {
                return Err(BindingError::Closed);
            }
            if n < ADDR_LEN {
                debug!(self.log, "short data record"; "n_bytes" => n);
                continue;
            }
            let src = u16::from_le_bytes([record[0], record[1]]);
            record.truncate(n);
            record.drain(..ADDR_LEN);
            return Ok((src, record));
        }
    }
}

/// The monitor half of the transport driver.
#[derive(Debug)]
pub struct DevLinkMonitor {
    log: Logger,
    file: File,
}

impl DevLinkMonitor {
    pub async fn open(path: impl AsRef<Path>, log: Logger) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().read(true).open(path.as_ref()).await?;
        info!(log, "opened monitor device"; "device" => %path.as_ref().display());
        Ok(Self { log, file })
    }
}

impl LinkMonitor for DevLinkMonitor {
    async fn next_event(&mut self) -> Result<MonitorEvent, BindingError> {
        loop {
            let mut record = [0u8; 3];
            let n = self.file.read(&mut record).await?;
            if n == 0 {
                return Err(BindingError::Closed);
            }
            if n < record.len() {
                debug!(self.log, "short monitor record"; "n_bytes" => n);
                continue;
            }
            let bdf = u16::from_le_bytes([record[1], record[2]]);
            match record[0] {
                EVENT_DETACH => return Ok(MonitorEvent::Detach(bdf)),
                EVENT_ATTACH => return Ok(MonitorEvent::Attach(bdf)),
                other => {
                    debug!(self.log, "unknown monitor event"; "event" => other);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DevFrameDriver;
    use super::DevLinkMonitor;
    use crate::pcie::FrameDriver;
    use crate::pcie::LinkMonitor;
    use crate::pcie::MonitorEvent;
    use crate::test_utils;
    use std::io::Seek;
    use std::io::Write;

    #[tokio::test]
    async fn test_send_writes_addressed_record() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut driver = DevFrameDriver::open(file.path(), test_utils::test_logger())
            .await
            .unwrap();
        driver.send(0x1f00, &[0x09, 0x08, 0xC8]).await.unwrap();

        let written = std::fs::read(file.path()).unwrap();
        assert_eq!(written, vec![0x00, 0x1f, 0x09, 0x08, 0xC8]);
    }

    #[tokio::test]
    async fn test_recv_strips_source_prefix() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x00, 0x1f, 0x08, 0x09, 0xC8]).unwrap();
        file.rewind().unwrap();

        let mut driver = DevFrameDriver::open(file.path(), test_utils::test_logger())
            .await
            .unwrap();
        let (src, frame) = driver.recv().await.unwrap();
        assert_eq!(src, 0x1f00);
        assert_eq!(frame, vec![0x08, 0x09, 0xC8]);
    }

    #[tokio::test]
    async fn test_monitor_decodes_events() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[1, 0x00, 0x1f, 0, 0x00, 0x1f]).unwrap();
        file.rewind().unwrap();

        let mut monitor = DevLinkMonitor::open(file.path(), test_utils::test_logger())
            .await
            .unwrap();
        assert_eq!(
            monitor.next_event().await.unwrap(),
            MonitorEvent::Attach(0x1f00)
        );
        assert_eq!(
            monitor.next_event().await.unwrap(),
            MonitorEvent::Detach(0x1f00)
        );
    }
}
