//! Packet framing over byte-opaque transports.
//!
//! A framer turns a stream of bytes into delimited packets and back. The
//! concrete codec lives in [`hdlc`]; this module holds the configuration,
//! statistics and the receive-side sink seam shared by framer
//! implementations.

pub mod hdlc;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::crc::{CrcParams, CRC_NONE};
use crate::port::SerialPort;

/// Metadata delivered alongside each received frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameMeta {
    /// Wall-clock timestamp of the frame's first byte on the wire.
    pub rx_time: SystemTime,
}

/// Receiver of decoded frames.
///
/// Returning an error stops the framer's receive loop and surfaces the
/// error from `run`.
#[async_trait]
pub trait FrameSink: Send {
    async fn on_frame(&mut self, payload: &[u8], meta: &FrameMeta) -> io::Result<()>;
}

/// Synchronous closures are accepted as sinks directly.
#[async_trait]
impl<F> FrameSink for F
where
    F: FnMut(&[u8], &FrameMeta) -> io::Result<()> + Send,
{
    async fn on_frame(&mut self, payload: &[u8], meta: &FrameMeta) -> io::Result<()> {
        self(payload, meta)
    }
}

/// Generic interface to send packets over a stream.
#[async_trait]
pub trait Framer: Send + Sync {
    /// Frames and sends one payload, returning the number of wire bytes
    /// written.
    async fn send_frame(&self, payload: &[u8]) -> io::Result<u64>;

    /// Swaps the I/O collaborator. Must not run concurrently with `run`.
    async fn set_port(&self, port: Arc<dyn SerialPort>);

    fn stats(&self) -> FramerStats;

    /// Runs the receive loop until a port read error or a sink error.
    async fn run(&self, sink: &mut dyn FrameSink) -> io::Result<()>;
}

/// Snapshot of framer statistics.
///
/// `*_received` fields are consistent while the sink callback runs;
/// `*_sent` fields are consistent when no send is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FramerStats {
    pub frames_received_oversized: u64,
    pub frames_received_zero_length: u64,
    pub frames_received_wrong_checksum: u64,
    pub frames_received_valid: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub bytes_sent_escaped: u64,
    pub bytes_received: u64,
    pub bytes_received_escaped: u64,
}

/// Atomically updated counter cells behind a [`FramerStats`] snapshot.
#[derive(Default)]
pub(crate) struct StatsCells {
    pub frames_received_oversized: AtomicU64,
    pub frames_received_zero_length: AtomicU64,
    pub frames_received_wrong_checksum: AtomicU64,
    pub frames_received_valid: AtomicU64,
    pub frames_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_sent_escaped: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_received_escaped: AtomicU64,
}

impl StatsCells {
    pub fn snapshot(&self) -> FramerStats {
        FramerStats {
            frames_received_oversized: self.frames_received_oversized.load(Ordering::Relaxed),
            frames_received_zero_length: self.frames_received_zero_length.load(Ordering::Relaxed),
            frames_received_wrong_checksum: self
                .frames_received_wrong_checksum
                .load(Ordering::Relaxed),
            frames_received_valid: self.frames_received_valid.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_sent_escaped: self.bytes_sent_escaped.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_received_escaped: self.bytes_received_escaped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Error)]
pub enum FramerConfigError {
    /// A byte marked for TX escaping decodes to a byte the receiver drops,
    /// so a symmetric peer could never receive it.
    #[error("requested to escape char that will be ignored: {raw:02X} -> {escaped:02X}")]
    EscapeMapsToIgnored { raw: u8, escaped: u8 },
}

/// Framer configuration. The defaults match the classic HDLC byte set:
/// frame delimiter `0x7E`, escape `0x7D`, escape XOR `0x20`, control bytes
/// `0x00..=0x1F` escaped on send and dropped on receive.
#[derive(Clone)]
pub struct FramerConfig {
    pub crc: CrcParams,
    /// Maximum accepted frame length; 0 means unlimited.
    pub max_frame_len: usize,
    pub frame_start: u8,
    pub frame_end: u8,
    pub escape: u8,
    pub escape_xor: u8,
    /// Full override of the TX escape table.
    pub tx_escape: Option<[bool; 256]>,
    /// Full override of the RX ignore table.
    pub rx_ignore: Option<[bool; 256]>,
    /// When true (default) the peer is assumed to use the same tables and
    /// the escape/ignore combination is sanity-checked at construction.
    pub tx_rx_symmetric: bool,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            crc: CRC_NONE,
            max_frame_len: 256,
            frame_start: 0x7E,
            frame_end: 0x7E,
            escape: 0x7D,
            escape_xor: 0x20,
            tx_escape: None,
            rx_ignore: None,
            tx_rx_symmetric: true,
        }
    }
}

impl FramerConfig {
    pub fn with_crc(mut self, crc: CrcParams) -> Self {
        self.crc = crc;
        self
    }

    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    pub fn with_tx_escape(mut self, table: [bool; 256]) -> Self {
        self.tx_escape = Some(table);
        self
    }

    pub fn with_rx_ignore(mut self, table: [bool; 256]) -> Self {
        self.rx_ignore = Some(table);
        self
    }

    pub fn with_tx_rx_symmetric(mut self, symmetric: bool) -> Self {
        self.tx_rx_symmetric = symmetric;
        self
    }
}
