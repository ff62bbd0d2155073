//! HDLC-style byte framer.
//!
//! Frames are `START (escaped payload) (escaped CRC, little-endian) END`.
//! A byte in the TX escape table is sent as `ESCAPE, byte ^ ESCAPE_XOR`;
//! bytes in the RX ignore table are dropped before the receive state
//! machine sees them. The frame delimiters and the escape byte itself are
//! always escaped.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

use super::{FrameMeta, FrameSink, Framer, FramerConfig, FramerConfigError, FramerStats, StatsCells};
use crate::crc::{Crc, CrcParams};
use crate::port::{write_all, SerialPort};

use std::sync::atomic::Ordering;

const READ_CHUNK: usize = 512;

pub struct HdlcFramer {
    port: Mutex<Arc<dyn SerialPort>>,
    send_buf: tokio::sync::Mutex<BytesMut>,
    stats: StatsCells,

    crc: CrcParams,
    max_frame_len: usize,
    tx_escape: [bool; 256],
    rx_ignore: [bool; 256],

    frame_start: u8,
    frame_end: u8,
    escape: u8,
    escape_xor: u8,
}

impl std::fmt::Debug for HdlcFramer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HdlcFramer")
            .field("crc", &self.crc)
            .field("max_frame_len", &self.max_frame_len)
            .field("frame_start", &self.frame_start)
            .field("frame_end", &self.frame_end)
            .field("escape", &self.escape)
            .field("escape_xor", &self.escape_xor)
            .finish_non_exhaustive()
    }
}

impl HdlcFramer {
    pub fn new(
        port: Arc<dyn SerialPort>,
        config: FramerConfig,
    ) -> Result<Self, FramerConfigError> {
        let mut tx_escape = [false; 256];
        let mut rx_ignore = [false; 256];
        for i in 0..0x20 {
            tx_escape[i] = true;
            rx_ignore[i] = true;
        }
        if let Some(table) = config.tx_escape {
            tx_escape = table;
        }
        if let Some(table) = config.rx_ignore {
            rx_ignore = table;
        }

        // These bytes must be escaped for the protocol to work.
        tx_escape[config.frame_end as usize] = true;
        tx_escape[config.frame_start as usize] = true;
        tx_escape[config.escape as usize] = true;

        if config.tx_rx_symmetric {
            for raw in 0..tx_escape.len() {
                if tx_escape[raw] {
                    let escaped = raw as u8 ^ config.escape_xor;
                    if rx_ignore[escaped as usize] {
                        return Err(FramerConfigError::EscapeMapsToIgnored {
                            raw: raw as u8,
                            escaped,
                        });
                    }
                }
            }
        }

        Ok(Self {
            port: Mutex::new(port),
            send_buf: tokio::sync::Mutex::new(BytesMut::new()),
            stats: StatsCells::default(),
            crc: config.crc,
            max_frame_len: config.max_frame_len,
            tx_escape,
            rx_ignore,
            frame_start: config.frame_start,
            frame_end: config.frame_end,
            escape: config.escape,
            escape_xor: config.escape_xor,
        })
    }

    fn current_port(&self) -> Arc<dyn SerialPort> {
        Arc::clone(&self.port.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn put_escaped(&self, buf: &mut BytesMut, payload: &[u8]) {
        for &byte in payload {
            if self.tx_escape[byte as usize] {
                buf.put_u8(self.escape);
                buf.put_u8(byte ^ self.escape_xor);
            } else {
                buf.put_u8(byte);
            }
        }
    }

    /// Encodes one frame into wire bytes without sending it. Exposed for
    /// peers that assemble their own transmissions (and for tests).
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(payload.len() * 2 + 4);
        buf.put_u8(self.frame_start);
        self.put_escaped(&mut buf, payload);

        let mut crc = Crc::new(self.crc);
        let mut crc_buf = [0u8; 8];
        let crc_bytes = crc.update(payload).result_bytes_le(&mut crc_buf);
        self.put_escaped(&mut buf, crc_bytes);
        buf.put_u8(self.frame_end);
        buf.to_vec()
    }
}

#[async_trait]
impl Framer for HdlcFramer {
    async fn send_frame(&self, payload: &[u8]) -> io::Result<u64> {
        let mut buf = self.send_buf.lock().await;
        buf.clear();
        buf.put_u8(self.frame_start);
        self.put_escaped(&mut buf, payload);

        let mut crc = Crc::new(self.crc);
        let mut crc_buf = [0u8; 8];
        let crc_bytes = crc.update(payload).result_bytes_le(&mut crc_buf);
        self.put_escaped(&mut buf, crc_bytes);
        buf.put_u8(self.frame_end);

        let port = self.current_port();
        let result = write_all(port.as_ref(), &buf).await;
        let written = buf.len() as u64;

        if result.is_ok() {
            self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes_sent
                .fetch_add(payload.len() as u64, Ordering::Relaxed);
            self.stats
                .bytes_sent_escaped
                .fetch_add(written, Ordering::Relaxed);
        }
        result.map(|()| written)
    }

    async fn set_port(&self, port: Arc<dyn SerialPort>) {
        // The send lock keeps the swap out of any in-flight transmission.
        let _guard = self.send_buf.lock().await;
        *self.port.lock().unwrap_or_else(PoisonError::into_inner) = port;
    }

    fn stats(&self) -> FramerStats {
        self.stats.snapshot()
    }

    async fn run(&self, sink: &mut dyn FrameSink) -> io::Result<()> {
        let mut tmp = [0u8; READ_CHUNK];
        let mut rx_buf = BytesMut::new();

        let mut is_escaped = false;
        let mut is_valid = true;
        let mut is_first = true;
        let mut first_byte_time = SystemTime::now();

        let crc_len = self.crc.result_len();

        loop {
            let port = self.current_port();
            let n = port.read(&mut tmp).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }

            for &byte in &tmp[..n] {
                self.stats
                    .bytes_received_escaped
                    .fetch_add(1, Ordering::Relaxed);

                if is_first {
                    first_byte_time = SystemTime::now();
                    is_first = false;
                }

                if byte == self.frame_end {
                    if !rx_buf.is_empty() {
                        self.stats
                            .bytes_received
                            .fetch_add(rx_buf.len() as u64, Ordering::Relaxed);

                        if is_valid && !is_escaped {
                            self.stats
                                .frames_received_valid
                                .fetch_add(1, Ordering::Relaxed);

                            if rx_buf.len() < crc_len {
                                self.stats
                                    .frames_received_wrong_checksum
                                    .fetch_add(1, Ordering::Relaxed);
                            } else {
                                let crc_index = rx_buf.len() - crc_len;
                                let mut crc = Crc::new(self.crc);
                                let mut crc_buf = [0u8; 8];
                                let computed = crc
                                    .update(&rx_buf[..crc_index])
                                    .result_bytes_le(&mut crc_buf);

                                if computed == &rx_buf[crc_index..] {
                                    let meta = FrameMeta {
                                        rx_time: first_byte_time,
                                    };
                                    sink.on_frame(&rx_buf[..crc_index], &meta).await?;
                                } else {
                                    self.stats
                                        .frames_received_wrong_checksum
                                        .fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                    } else {
                        self.stats
                            .frames_received_zero_length
                            .fetch_add(1, Ordering::Relaxed);
                    }

                    is_valid = true;
                    is_escaped = false;
                    is_first = true;
                    rx_buf.clear();
                } else if byte == self.frame_start {
                    // Resynchronize.
                    is_valid = true;
                    is_escaped = false;
                    is_first = true;
                    rx_buf.clear();
                } else if self.rx_ignore[byte as usize] {
                    // Dropped before the state machine sees it.
                } else if is_escaped {
                    is_escaped = false;
                    if is_valid {
                        rx_buf.put_u8(byte ^ self.escape_xor);
                    }
                } else if byte == self.escape {
                    is_escaped = true;
                } else if is_valid {
                    rx_buf.put_u8(byte);
                }

                if is_valid && self.max_frame_len > 0 && rx_buf.len() > self.max_frame_len {
                    self.stats
                        .frames_received_oversized
                        .fetch_add(1, Ordering::Relaxed);
                    is_valid = false;
                }
            }
        }
    }
}
