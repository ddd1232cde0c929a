//! Typed SSM2 requests atop a `SerialTransport`: ECU identity, multi-address
//! reads, and the adaptive chunked reader.

use std::collections::HashMap;
use std::thread::sleep;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::codec::{self, build_frame, FrameScan, TESTER_ADDR};
use super::serial_link::SerialTransport;

#[derive(Debug, Error)]
pub enum Ssm2Error {
    #[error("no valid SSM2 frame arrived before the deadline")]
    Timeout,
    #[error("frame checksum never resolved: {0}")]
    FrameError(String),
    #[error("protocol violation: {0}")]
    ProtocolError(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub const MAX_MULTI_READ_ADDRS: usize = 84;
const READ_POLL_CHUNK: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomIdentity {
    pub sys_id: [u8; 3],
    pub rom_id: [u8; 5],
    pub flagbytes: Vec<u8>,
}

impl RomIdentity {
    pub fn rom_id_hex(&self) -> String {
        self.rom_id.iter().map(|b| format!("{b:02X}")).collect()
    }

    pub fn sys_id_hex(&self) -> String {
        self.sys_id.iter().map(|b| format!("{b:02X}")).collect()
    }
}

pub struct SSM2Client<T: SerialTransport> {
    link: T,
    ecu_addr: u8,
    pad_addr: u8,
    rx_buf: Vec<u8>,
}

impl<T: SerialTransport> SSM2Client<T> {
    pub fn new(link: T, ecu_addr: u8, pad_addr: u8) -> Self {
        Self { link, ecu_addr, pad_addr, rx_buf: Vec::new() }
    }

    /// Flushes I/O buffers, writes the framed request, then reads until a
    /// valid reply frame for this ECU arrives or `timeout` elapses.
    pub fn request(&mut self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>, Ssm2Error> {
        self.link.flush_input()?;
        self.rx_buf.clear();
        let frame = build_frame(self.ecu_addr, TESTER_ADDR, payload);
        self.link.write_all(&frame)?;

        let deadline = Instant::now() + timeout;
        let mut saw_mismatch = false;
        let mut poll_buf = [0u8; READ_POLL_CHUNK];

        loop {
            loop {
                match codec::scan(&self.rx_buf) {
                    FrameScan::NeedMoreData => break,
                    FrameScan::Drop { n, mismatch } => {
                        saw_mismatch |= mismatch;
                        self.rx_buf.drain(0..n);
                    }
                    FrameScan::Frame { consumed, frame } => {
                        self.rx_buf.drain(0..consumed);
                        // Local echo of our own request: keep scanning.
                        if frame.dst == self.ecu_addr && frame.src == TESTER_ADDR {
                            continue;
                        }
                        if frame.dst == TESTER_ADDR && frame.src == self.ecu_addr {
                            return Ok(frame.payload);
                        }
                        // Frame addressed elsewhere; ignore and keep scanning.
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(if saw_mismatch {
                    Ssm2Error::FrameError("checksum never resolved before deadline".into())
                } else {
                    Ssm2Error::Timeout
                });
            }

            let n = self.link.read_available(&mut poll_buf)?;
            if n > 0 {
                self.rx_buf.extend_from_slice(&poll_buf[..n]);
            }
        }
    }

    /// `GET_CU_DATA` (0xBF): sys_id / rom_id / flagbytes handshake.
    pub fn get_cu_data(&mut self, timeout: Duration) -> Result<RomIdentity, Ssm2Error> {
        let payload = self.request(&[0xBF], timeout)?;
        if payload.first() != Some(&0xFF) || payload.len() < 9 {
            return Err(Ssm2Error::ProtocolError(format!(
                "unexpected GET_CU_DATA reply ({} bytes)",
                payload.len()
            )));
        }
        let mut sys_id = [0u8; 3];
        sys_id.copy_from_slice(&payload[1..4]);
        let mut rom_id = [0u8; 5];
        rom_id.copy_from_slice(&payload[4..9]);
        Ok(RomIdentity { sys_id, rom_id, flagbytes: payload[9..].to_vec() })
    }

    /// `READ_ADDRESSES` (0xA8): up to `MAX_MULTI_READ_ADDRS` 24-bit addresses
    /// in one request, returning one byte per address in order.
    pub fn read_multiple(&mut self, addrs: &[u32], timeout: Duration) -> Result<Vec<u8>, Ssm2Error> {
        if addrs.len() > MAX_MULTI_READ_ADDRS {
            return Err(Ssm2Error::ProtocolError(format!(
                "{} addresses exceeds the {} hard limit",
                addrs.len(),
                MAX_MULTI_READ_ADDRS
            )));
        }
        let mut payload = Vec::with_capacity(2 + addrs.len() * 3);
        payload.push(0xA8);
        payload.push(self.pad_addr);
        for addr in addrs {
            payload.push(((addr >> 16) & 0xFF) as u8);
            payload.push(((addr >> 8) & 0xFF) as u8);
            payload.push((addr & 0xFF) as u8);
        }

        let reply = self.request(&payload, timeout)?;
        if reply.first() != Some(&0xE8) || reply.len() - 1 != addrs.len() {
            return Err(Ssm2Error::ProtocolError(format!(
                "READ_ADDRESSES reply length mismatch: expected {}, got {}",
                addrs.len(),
                reply.len().saturating_sub(1)
            )));
        }
        Ok(reply[1..].to_vec())
    }
}

pub struct ChunkedReadOptions {
    pub chunk_size: usize,
    pub retries: u32,
    pub inter_delay: Duration,
    pub timeout: Duration,
    pub best_effort: bool,
}

/// Adaptive chunked read: halves the chunk size on sustained failure, and in
/// `best_effort` mode skips a single address that still fails rather than
/// aborting the whole read.
pub fn read_chunked<T: SerialTransport>(
    client: &mut SSM2Client<T>,
    addrs: &[u32],
    opts: &ChunkedReadOptions,
) -> Result<HashMap<u32, u8>, Ssm2Error> {
    let mut out = HashMap::new();
    let mut remaining = addrs;
    let mut chunk_size = opts.chunk_size.max(1);

    while !remaining.is_empty() {
        let take = chunk_size.min(remaining.len());
        let prefix = &remaining[..take];

        let mut last_err = None;
        let mut succeeded = None;
        for attempt in 0..=opts.retries {
            match client.read_multiple(prefix, opts.timeout) {
                Ok(values) => {
                    succeeded = Some(values);
                    break;
                }
                Err(e) => {
                    last_err = Some(e);
                    if attempt < opts.retries {
                        sleep(opts.inter_delay);
                    }
                }
            }
        }

        if let Some(values) = succeeded {
            for (addr, value) in prefix.iter().zip(values) {
                out.insert(*addr, value);
            }
            remaining = &remaining[take..];
            continue;
        }

        if chunk_size > 1 {
            chunk_size /= 2;
            continue;
        }

        if opts.best_effort {
            remaining = &remaining[1..];
            continue;
        }

        return Err(last_err.unwrap_or(Ssm2Error::Timeout));
    }

    Ok(out)
}
