// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The SMBus binding.
//!
//! SMBus presents a continuous byte stream with no intrinsic packet
//! boundaries, so packets travel inside a simple frame:
//!
//! | bytes | content |
//! |-------|---------|
//! | 0     | frame marker, `0xAA` |
//! | 1     | destination bus address |
//! | 2     | source bus address |
//! | 3     | packet length `n` |
//! | 4..   | the packet, `n` bytes |
//! | 4+n   | XOR checksum over bytes 1 through `3+n` |
//!
//! A bad checksum means framing was lost; the receiver resynchronizes by
//! discarding the presumed marker byte and scanning for the next one. SMBus
//! carries no out-of-band topology events, so this binding never emits link
//! events; peers are found through the configured probe list, their own
//! traffic, or an explicit discover request.

use crate::binding::Binding;
use crate::binding::BindingError;
use crate::binding::BindingInput;
use crate::binding::PhysicalAddr;
use crate::binding::TransmitError;
use crate::config::SmbusConfig;
use mctpd_wire::HEADER_LEN;
use slog::debug;
use slog::info;
use slog::Logger;
use tokio::fs::File;
use tokio::fs::OpenOptions;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

/// The byte opening every frame.
pub const FRAME_MARKER: u8 = 0xAA;

/// Frame overhead: marker, both addresses, the length byte, the checksum.
const FRAME_OVERHEAD: usize = 5;

/// The largest payload MTU an SMBus binding may be configured with. The
/// single length byte covers the whole packet, header included.
pub const SMBUS_MAX_MTU: usize = u8::MAX as usize - HEADER_LEN;

/// Build the wire frame carrying `packet` from `src` to `dest`.
pub(crate) fn encode_frame(dest: u8, src: u8, packet: &[u8]) -> Vec<u8> {
    debug_assert!(packet.len() <= u8::MAX as usize);
    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + packet.len());
    frame.push(FRAME_MARKER);
    frame.push(dest);
    frame.push(src);
    frame.push(packet.len() as u8);
    frame.extend_from_slice(packet);
    let checksum = frame[1..].iter().fold(0u8, |acc, b| acc ^ b);
    frame.push(checksum);
    frame
}

/// The SMBus binding, generic over the underlying stream so tests can drive
/// it over an in-memory duplex pipe.
#[derive(Debug)]
pub struct SmbusBinding<S> {
    log: Logger,
    stream: S,
    own_address: u8,
    mtu: usize,
    /// Bytes read from the stream but not yet consumed as frames.
    pending: Vec<u8>,
}

impl SmbusBinding<File> {
    /// Open the bus device named in the configuration.
    pub async fn open(config: &SmbusConfig, log: Logger) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.device)
            .await?;
        info!(
            log,
            "opened SMBus device";
            "device" => %config.device.display(),
            "own_address" => format!("0x{:02x}", config.own_address),
        );
        Ok(Self::new(file, config, log))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SmbusBinding<S> {
    pub fn new(stream: S, config: &SmbusConfig, log: Logger) -> Self {
        Self {
            log,
            stream,
            own_address: config.own_address,
            mtu: config.mtu,
            pending: Vec::new(),
        }
    }

    // Pull the next whole frame addressed to us out of `pending`, if one has
    // fully arrived. Garbage before a marker and corrupt frames are
    // discarded along the way.
    fn take_frame(&mut self) -> Option<(u8, Vec<u8>)> {
        loop {
            let Some(start) = self.pending.iter().position(|&b| b == FRAME_MARKER) else {
                // Nothing resembling a frame; drop the noise.
                if !self.pending.is_empty() {
                    debug!(
                        self.log,
                        "discarding bytes with no frame marker";
                        "n_bytes" => self.pending.len(),
                    );
                    self.pending.clear();
                }
                return None;
            };
            if start > 0 {
                debug!(
                    self.log,
                    "skipping bytes before frame marker";
                    "n_bytes" => start,
                );
                self.pending.drain(..start);
            }
            if self.pending.len() < FRAME_OVERHEAD {
                return None;
            }
            let len = usize::from(self.pending[3]);
            let total = FRAME_OVERHEAD + len;
            if self.pending.len() < total {
                return None;
            }
            let expected = self.pending[1..total - 1].iter().fold(0u8, |acc, b| acc ^ b);
            if expected != self.pending[total - 1] {
                // Framing was lost. Drop the presumed marker and rescan;
                // the real frame boundary may be inside this span.
                debug!(self.log, "frame checksum mismatch, resynchronizing");
                self.pending.drain(..1);
                continue;
            }
            let dest = self.pending[1];
            let src = self.pending[2];
            let packet = self.pending[4..4 + len].to_vec();
            self.pending.drain(..total);
            if dest != self.own_address {
                debug!(
                    self.log,
                    "ignoring frame for another bus address";
                    "dest" => format!("0x{dest:02x}"),
                );
                continue;
            }
            return Some((src, packet));
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Binding for SmbusBinding<S> {
    fn name(&self) -> &'static str {
        "smbus"
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn transmit(&mut self, addr: PhysicalAddr, packet: &[u8]) -> Result<(), TransmitError> {
        let PhysicalAddr::Smbus(dest) = addr else {
            return Err(TransmitError::WrongBus(addr));
        };
        if packet.len() > HEADER_LEN + self.mtu {
            return Err(TransmitError::Oversize { mtu: self.mtu });
        }
        let frame = encode_frame(dest, self.own_address, packet);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn next_input(&mut self) -> Result<BindingInput, BindingError> {
        loop {
            if let Some((src, bytes)) = self.take_frame() {
                return Ok(BindingInput::Packet {
                    addr: PhysicalAddr::Smbus(src),
                    bytes,
                });
            }
            // `read` is cancel-safe; a cancelled call leaves `pending`
            // untouched.
            let mut chunk = [0u8; 256];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(BindingError::Closed);
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }
}
