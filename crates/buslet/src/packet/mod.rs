//! Addressed command/reply packet protocol.
//!
//! Wire frames are `'B' [addr] length payload crc`, where the address byte
//! is present only for non-broadcast devices. The CRC is CRC-8 over the
//! payload, XOR-tagged with the target device's compressed serial for all
//! message types except Ping and Id, and remapped 0 → 0xAA on the wire.
//!
//! A [`Bus`] owns the port and a single dispatch loop; [`Device`] handles
//! are lightweight and may be created per bus address. At most one command
//! is outstanding at any time: replies correlate by arrival order, a
//! missing reply is converted into a synthetic timeout, and any error reply
//! resets the line.

mod device;

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use buslet_sync::closeflag::CloseFlag;

use crate::crc::{checksum, CRC_8_PACKET};
use crate::port::{write_all, SerialPort};

pub use device::Device;
use device::DeviceShared;

/// Broadcast address; frames to it omit the address byte.
pub const BROADCAST_ADDRESS: u8 = 0xFF;

/// Default reply budget for built-in queries (ping, serial, system time).
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

const SYNC_BYTE: u8 = b'B';
const CRC_ZERO_SUBSTITUTE: u8 = 0xAA;
/// Zero run for the reset sequence: one maximum frame plus the sync and
/// length bytes, so any partially received frame is flushed out.
const RESET_RUN_LEN: usize = 258;
const DRAIN_WINDOW: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 64;

/// Protocol message type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType(pub u8);

impl MessageType {
    pub const PING: MessageType = MessageType(0x01);
    pub const ID_HASH: MessageType = MessageType(0x02);
    pub const ID: MessageType = MessageType(0x03);
    pub const SYS_TIME: MessageType = MessageType(0x04);
    pub const NACK: MessageType = MessageType(0xFE);
    pub const ACK: MessageType = MessageType(0xFF);
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("command timeout")]
    Timeout,
    #[error("command rejected")]
    Nack,
    #[error("invalid sync response")]
    SyncFailed,
    #[error("not connected")]
    NotConnected,
    #[error("bus is closed")]
    Closed,
    #[error("malformed packet: {0}")]
    ProtocolFormat(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Handler for received packets that are neither Ack nor Nack.
pub type UnsolicitedHandler = Box<dyn Fn(MessageType, &[u8]) + Send + Sync>;

pub(crate) struct Command {
    pub(crate) device: Arc<DeviceShared>,
    /// Message type byte followed by the command payload.
    pub(crate) packet: Vec<u8>,
    /// `None` marks an unsolicited command: it completes once written.
    pub(crate) timeout: Option<Duration>,
    pub(crate) reply_tx: oneshot::Sender<Result<Vec<u8>, BusError>>,
}

pub(crate) struct BusShared {
    pub(crate) port: Arc<dyn SerialPort>,
    pub(crate) cmd_tx: mpsc::Sender<Command>,
    unsolicited: Mutex<Option<UnsolicitedHandler>>,
    unlock_key: Option<Vec<u8>>,
    closed: CloseFlag,
}

#[derive(Clone)]
pub struct BusConfig {
    /// Key emitted between the zero runs of the reset sequence, for
    /// devices that hold the line locked until they see it.
    pub unlock_key: Option<Vec<u8>>,
    /// Depth of the command intake queue.
    pub command_queue_depth: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            unlock_key: None,
            command_queue_depth: 20,
        }
    }
}

impl BusConfig {
    pub fn with_unlock_key(mut self, key: Vec<u8>) -> Self {
        self.unlock_key = Some(key);
        self
    }
}

/// CRC over a packet as it appears on the wire.
///
/// `device` tags the CRC with its compressed serial for message types
/// other than Ping and Id; such a send requires the device to be synced.
/// The received side verifies with `device = None`. A result of 0 is
/// remapped to 0xAA.
pub(crate) fn wire_crc(
    device: Option<&DeviceShared>,
    msg_type: MessageType,
    packet: &[u8],
) -> Result<u8, BusError> {
    let mut crc = checksum(CRC_8_PACKET, packet) as u8;

    if let Some(device) = device {
        if msg_type != MessageType::PING && msg_type != MessageType::ID {
            let sync = device.lock_sync();
            crc ^= sync.compressed_serial;
            if !sync.synced {
                return Err(BusError::NotConnected);
            }
        }
    }

    if crc == 0 {
        crc = CRC_ZERO_SUBSTITUTE;
    }
    Ok(crc)
}

fn build_frame(device: &DeviceShared, packet: &[u8]) -> Result<Vec<u8>, BusError> {
    if packet.is_empty() || packet.len() > 255 {
        return Err(BusError::ProtocolFormat(format!(
            "payload length {} out of range",
            packet.len()
        )));
    }

    let mut frame = Vec::with_capacity(packet.len() + 3);
    frame.push(SYNC_BYTE);
    if device.address != BROADCAST_ADDRESS {
        frame.push(device.address);
    }
    frame.push(packet.len() as u8);
    frame.extend_from_slice(packet);
    frame.push(wire_crc(Some(device), MessageType(packet[0]), packet)?);
    Ok(frame)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    WaitSync,
    ReadLength,
    ReadPacket,
    ReadCrc,
}

/// A serial packet bus: owns the port and the dispatch loop.
pub struct Bus {
    shared: Arc<BusShared>,
    cmd_rx: Mutex<Option<mpsc::Receiver<Command>>>,
}

impl Bus {
    pub fn new(port: Arc<dyn SerialPort>, config: BusConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_queue_depth.max(1));

        Self {
            shared: Arc::new(BusShared {
                port,
                cmd_tx,
                unsolicited: Mutex::new(None),
                unlock_key: config.unlock_key,
                closed: CloseFlag::new(),
            }),
            cmd_rx: Mutex::new(Some(cmd_rx)),
        }
    }

    /// Device handle for the broadcast address (no address byte on the
    /// wire).
    pub fn default_device(&self) -> Device {
        self.device(BROADCAST_ADDRESS)
    }

    /// Device handle for a specific bus address.
    pub fn device(&self, address: u8) -> Device {
        Device::new(Arc::clone(&self.shared), address)
    }

    /// Installs the handler invoked for packets that are neither Ack nor
    /// Nack.
    pub fn set_unsolicited_handler(&self, handler: UnsolicitedHandler) {
        *self
            .shared
            .unsolicited
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Runs the dispatch loop: resets the line, then serves incoming
    /// bytes, command timeouts and queued commands until the port read
    /// fails or reaches end-of-stream.
    pub async fn run(&self) -> Result<(), BusError> {
        let cmd_rx = self
            .cmd_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .expect("bus dispatch loop already started");

        let (rx_tx, rx_rx) = mpsc::channel::<io::Result<Vec<u8>>>(1);
        let (ack_tx, mut ack_rx) = mpsc::channel::<()>(1);

        let port = Arc::clone(&self.shared.port);
        tokio::spawn(async move {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match port.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if rx_tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                        // The handshake keeps the dispatcher from being
                        // overtaken: no chunk is dropped on shutdown.
                        if ack_rx.recv().await.is_none() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = rx_tx.send(Err(err)).await;
                        break;
                    }
                }
            }
            tracing::debug!("bus read worker exiting");
        });

        let dispatcher = Dispatcher {
            shared: Arc::clone(&self.shared),
            rx_rx,
            ack_tx,
            cmd_rx,
            state: RxState::WaitSync,
            length: 0,
            index: 0,
            buffer: [0u8; 256],
            current: None,
            deadline: None,
        };
        dispatcher.run().await
    }

    /// Closes the bus and its port. A second close returns the benign
    /// [`BusError::Closed`] sentinel.
    pub async fn close(&self) -> Result<(), BusError> {
        if self.shared.closed.close().is_err() {
            return Err(BusError::Closed);
        }
        self.shared.port.close().await.map_err(BusError::Io)
    }
}

struct Dispatcher {
    shared: Arc<BusShared>,
    rx_rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    ack_tx: mpsc::Sender<()>,
    cmd_rx: mpsc::Receiver<Command>,

    state: RxState,
    length: usize,
    index: usize,
    buffer: [u8; 256],

    current: Option<Command>,
    deadline: Option<tokio::time::Instant>,
}

impl Dispatcher {
    async fn run(mut self) -> Result<(), BusError> {
        self.send_reset().await;

        loop {
            let deadline = self
                .deadline
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(86_400));

            tokio::select! {
                biased;

                chunk = self.rx_rx.recv() => match chunk {
                    Some(Ok(bytes)) => {
                        self.process_input(&bytes).await;
                        let _ = self.ack_tx.send(()).await;
                    }
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "bus port read failed");
                        return Err(BusError::Io(err));
                    }
                    None => {
                        tracing::debug!("bus port reached end-of-stream");
                        return Ok(());
                    }
                },

                _ = tokio::time::sleep_until(deadline), if self.deadline.is_some() => {
                    tracing::debug!("outstanding command timed out");
                    self.complete_command(Err(BusError::Timeout)).await;
                }

                cmd = self.cmd_rx.recv(), if self.current.is_none() => match cmd {
                    Some(cmd) => self.start_command(cmd).await,
                    None => return Ok(()),
                },
            }
        }
    }

    async fn start_command(&mut self, cmd: Command) {
        let frame = build_frame(&cmd.device, &cmd.packet);
        let timeout = cmd.timeout;
        self.current = Some(cmd);

        match frame {
            Err(err) => self.complete_command(Err(err)).await,
            Ok(frame) => match write_all(self.shared.port.as_ref(), &frame).await {
                Err(err) => self.complete_command(Err(BusError::Io(err))).await,
                Ok(()) => match timeout {
                    // An unsolicited command is complete once written.
                    None => self.complete_command(Ok(Vec::new())).await,
                    Some(timeout) => {
                        self.deadline = Some(tokio::time::Instant::now() + timeout);
                    }
                },
            },
        }
    }

    /// Delivers the reply for the outstanding command, if any. Error
    /// replies reset the line first.
    async fn complete_command(&mut self, result: Result<Vec<u8>, BusError>) {
        if result.is_err() {
            self.send_reset().await;
        }

        if let Some(cmd) = self.current.take() {
            let _ = cmd.reply_tx.send(result);
        }
        self.deadline = None;
    }

    async fn process_input(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            match self.state {
                RxState::WaitSync => {
                    if byte == SYNC_BYTE {
                        self.state = RxState::ReadLength;
                    }
                }
                RxState::ReadLength => {
                    self.length = byte as usize;
                    self.index = 0;
                    self.state = if byte == 0 {
                        RxState::WaitSync
                    } else {
                        RxState::ReadPacket
                    };
                }
                RxState::ReadPacket => {
                    self.buffer[self.index] = byte;
                    self.index += 1;
                    if self.index == self.length {
                        self.state = RxState::ReadCrc;
                    }
                }
                RxState::ReadCrc => {
                    let packet = &self.buffer[..self.length];
                    let expected = wire_crc(None, MessageType(packet[0]), packet)
                        .expect("receive-side CRC needs no device");

                    if expected == byte {
                        let msg_type = MessageType(packet[0]);
                        let payload = packet[1..].to_vec();

                        match msg_type {
                            MessageType::ACK => self.complete_command(Ok(payload)).await,
                            MessageType::NACK => {
                                self.complete_command(Err(BusError::Nack)).await;
                            }
                            _ => {
                                let handler = self
                                    .shared
                                    .unsolicited
                                    .lock()
                                    .unwrap_or_else(PoisonError::into_inner);
                                if let Some(handler) = handler.as_ref() {
                                    handler(msg_type, &payload);
                                }
                            }
                        }
                    }
                    self.state = RxState::WaitSync;
                }
            }
        }
    }

    /// Flushes the line: a run of zeros longer than any frame, a drain
    /// window, and (when configured) the unlock key bracketed by another
    /// zero run and drain.
    async fn send_reset(&mut self) {
        let zeros = [0u8; RESET_RUN_LEN];

        if let Err(err) = write_all(self.shared.port.as_ref(), &zeros).await {
            tracing::warn!(error = %err, "reset write failed");
            return;
        }
        self.drain(DRAIN_WINDOW).await;

        if let Some(key) = self.shared.unlock_key.clone() {
            if let Err(err) = write_all(self.shared.port.as_ref(), &key).await {
                tracing::warn!(error = %err, "unlock key write failed");
                return;
            }
            self.drain(DRAIN_WINDOW).await;

            if let Err(err) = write_all(self.shared.port.as_ref(), &zeros).await {
                tracing::warn!(error = %err, "reset write failed");
                return;
            }
            self.drain(DRAIN_WINDOW).await;
        }
    }

    /// Discards incoming bytes for `window`.
    async fn drain(&mut self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return,
                chunk = self.rx_rx.recv() => match chunk {
                    Some(Ok(_)) => {
                        let _ = self.ack_tx.send(()).await;
                    }
                    Some(Err(_)) | None => return,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{loopback, PipePort};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn reply_frame(msg_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![msg_type];
        packet.extend_from_slice(payload);
        let mut crc = checksum(CRC_8_PACKET, &packet) as u8;
        if crc == 0 {
            crc = CRC_ZERO_SUBSTITUTE;
        }
        let mut frame = vec![SYNC_BYTE, packet.len() as u8];
        frame.extend_from_slice(&packet);
        frame.push(crc);
        frame
    }

    /// Minimal device-side endpoint: parses master frames off the wire and
    /// answers Ping with an echo, Id/IdHash with its serial, SysTime with a
    /// 32-bit value, and 0x10 with a Nack. `ignore` swallows that many
    /// commands without answering.
    async fn run_fake_device(port: Arc<PipePort>, serial: Vec<u8>, ignore: Arc<AtomicU32>) {
        let mut buf = [0u8; 256];
        let mut pending: Vec<u8> = Vec::new();

        loop {
            let n = match port.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            pending.extend_from_slice(&buf[..n]);

            loop {
                let Some(start) = pending.iter().position(|&b| b == SYNC_BYTE) else {
                    pending.clear();
                    break;
                };
                pending.drain(..start);
                if pending.len() < 2 {
                    break;
                }
                let len = pending[1] as usize;
                if len == 0 {
                    pending.drain(..2);
                    continue;
                }
                if pending.len() < 2 + len + 1 {
                    break;
                }
                let packet: Vec<u8> = pending[2..2 + len].to_vec();
                pending.drain(..2 + len + 1);

                if ignore.load(Ordering::SeqCst) > 0 {
                    ignore.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }

                let reply = match MessageType(packet[0]) {
                    MessageType::PING => reply_frame(MessageType::ACK.0, &packet[1..]),
                    MessageType::ID | MessageType::ID_HASH => {
                        reply_frame(MessageType::ACK.0, &serial)
                    }
                    MessageType::SYS_TIME => reply_frame(MessageType::ACK.0, &[0, 0, 0, 42]),
                    MessageType(0x10) => reply_frame(MessageType::NACK.0, &[]),
                    _ => continue,
                };
                if write_all(port.as_ref(), &reply).await.is_err() {
                    return;
                }
            }
        }
    }

    struct Harness {
        bus: Arc<Bus>,
        ignore: Arc<AtomicU32>,
        device_port: Arc<PipePort>,
    }

    fn start_harness(serial: Vec<u8>) -> Harness {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let (master_port, device_port) = loopback(0);

        let bus = Arc::new(Bus::new(master_port, BusConfig::default()));
        let runner = Arc::clone(&bus);
        tokio::spawn(async move {
            let _ = runner.run().await;
        });

        let ignore = Arc::new(AtomicU32::new(0));
        tokio::spawn(run_fake_device(
            Arc::clone(&device_port),
            serial,
            Arc::clone(&ignore),
        ));

        Harness {
            bus,
            ignore,
            device_port,
        }
    }

    const SERIAL: [u8; 4] = [0x10, 0x20, 0x31, 0x04];

    #[tokio::test(start_paused = true)]
    async fn connect_syncs_and_compresses_serial() {
        let harness = start_harness(SERIAL.to_vec());
        let device = harness.bus.default_device();

        assert!(!device.is_synced());
        let serial = device.connect().await.unwrap();
        assert_eq!(serial, SERIAL);
        assert!(device.is_synced());
        assert_eq!(device.compressed_serial(), 0x10 ^ 0x20 ^ 0x31 ^ 0x04);

        device.test_comm().await.unwrap();
        assert_eq!(device.system_time().await.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn tagged_commands_require_sync() {
        let harness = start_harness(SERIAL.to_vec());
        let device = harness.bus.default_device();

        // SysTime is CRC-tagged with the device serial, so it must fail
        // before anything reaches the wire.
        let err = device.system_time().await.unwrap_err();
        assert!(matches!(err, BusError::NotConnected));

        // Ping carries no tag and works unsynced.
        let reply = device
            .send_command(MessageType::PING, &[0xAB], Some(DEFAULT_COMMAND_TIMEOUT))
            .await
            .unwrap();
        assert_eq!(reply, vec![0xAB]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_reply_times_out_and_recovers() {
        let harness = start_harness(SERIAL.to_vec());
        let device = harness.bus.default_device();

        harness.ignore.store(1, Ordering::SeqCst);
        let err = device
            .send_command(
                MessageType::PING,
                &[1, 2, 3],
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout));

        // The line was reset; the next exchange goes through.
        let reply = device
            .send_command(MessageType::PING, &[9], Some(DEFAULT_COMMAND_TIMEOUT))
            .await
            .unwrap();
        assert_eq!(reply, vec![9]);
    }

    #[tokio::test(start_paused = true)]
    async fn nack_is_surfaced() {
        let harness = start_harness(SERIAL.to_vec());
        let device = harness.bus.default_device();

        device.connect().await.unwrap();
        let err = device
            .send_command(MessageType(0x10), &[], Some(DEFAULT_COMMAND_TIMEOUT))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Nack));
    }

    #[tokio::test(start_paused = true)]
    async fn unsolicited_packets_reach_the_handler() {
        let harness = start_harness(SERIAL.to_vec());

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        harness
            .bus
            .set_unsolicited_handler(Box::new(move |msg_type, payload| {
                let _ = seen_tx.send((msg_type, payload.to_vec()));
            }));

        // Garbage, a zero-length frame and a corrupt frame around the real
        // one: only the valid frame is delivered.
        let mut wire = vec![0x00, 0x55, SYNC_BYTE, 0x00];
        let mut corrupt = reply_frame(0x21, &[0xEE]);
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        wire.extend_from_slice(&corrupt);
        wire.extend_from_slice(&reply_frame(0x21, &[1, 2, 3]));
        write_all(harness.device_port.as_ref(), &wire)
            .await
            .unwrap();

        let (msg_type, payload) = seen_rx.recv().await.unwrap();
        assert_eq!(msg_type, MessageType(0x21));
        assert_eq!(payload, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_ends_the_loop_and_fails_senders() {
        let harness = start_harness(SERIAL.to_vec());
        let device = harness.bus.default_device();

        device.connect().await.unwrap();
        harness.bus.close().await.unwrap();

        // Give the dispatch loop a moment to observe end-of-stream.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = device
            .send_command(MessageType::PING, &[1], Some(DEFAULT_COMMAND_TIMEOUT))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Closed));

        // Second close is the benign sentinel.
        assert!(matches!(
            harness.bus.close().await.unwrap_err(),
            BusError::Closed
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn write_error_is_delivered_as_the_reply() {
        struct DeadPort;

        #[async_trait]
        impl SerialPort for DeadPort {
            async fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
                std::future::pending().await
            }

            async fn write(&self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }

            async fn close(&self) -> io::Result<()> {
                Ok(())
            }
        }

        let bus = Arc::new(Bus::new(Arc::new(DeadPort), BusConfig::default()));
        let runner = Arc::clone(&bus);
        tokio::spawn(async move {
            let _ = runner.run().await;
        });

        let device = bus.default_device();
        let err = device
            .send_command(MessageType::PING, &[1], Some(DEFAULT_COMMAND_TIMEOUT))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Io(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_sequence_carries_the_unlock_key() {
        let (master_port, device_port) = loopback(0);
        let key = vec![0xDE, 0xAD, 0xC0];

        let bus = Arc::new(Bus::new(
            master_port,
            BusConfig::default().with_unlock_key(key.clone()),
        ));
        let runner = Arc::clone(&bus);
        tokio::spawn(async move {
            let _ = runner.run().await;
        });

        let expected_len = 2 * RESET_RUN_LEN + key.len();
        let mut seen = Vec::new();
        let mut buf = [0u8; 512];
        while seen.len() < expected_len {
            let n = device_port.read(&mut buf).await.unwrap();
            assert!(n > 0);
            seen.extend_from_slice(&buf[..n]);
        }

        assert!(seen[..RESET_RUN_LEN].iter().all(|&b| b == 0));
        assert_eq!(
            &seen[RESET_RUN_LEN..RESET_RUN_LEN + key.len()],
            key.as_slice()
        );
        assert!(seen[RESET_RUN_LEN + key.len()..expected_len]
            .iter()
            .all(|&b| b == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn bus_runs_under_a_lifecycle_group() {
        use buslet_sync::{MultiRun, Ready, Runnable};

        struct BusComponent {
            bus: Arc<Bus>,
        }

        #[async_trait]
        impl Runnable for BusComponent {
            async fn run(&self, ready: Ready) -> anyhow::Result<()> {
                ready.notify();
                self.bus.run().await?;
                Ok(())
            }

            async fn close(&self) -> anyhow::Result<()> {
                match self.bus.close().await {
                    Ok(()) | Err(BusError::Closed) => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
        }

        let (master_port, device_port) = loopback(0);
        let bus = Arc::new(Bus::new(master_port, BusConfig::default()));
        tokio::spawn(run_fake_device(
            device_port,
            SERIAL.to_vec(),
            Arc::new(AtomicU32::new(0)),
        ));

        let group = Arc::new(MultiRun::new());
        group.register(Arc::new(BusComponent {
            bus: Arc::clone(&bus),
        }));

        let runner = Arc::clone(&group);
        let run_task = tokio::spawn(async move { runner.run(None).await });

        let device = bus.default_device();
        device.connect().await.unwrap();

        group.close().await.unwrap();
        let result = run_task.await.unwrap();
        assert!(result.is_err(), "group close surfaces the Closed sentinel");
    }

    #[test]
    fn zero_crc_is_remapped_on_the_wire() {
        // Scan for a packet whose raw CRC-8 is zero, then check the remap.
        let mut found = false;
        for a in 0u16..=255 {
            for b in 0u16..=255 {
                let packet = [a as u8, b as u8];
                if checksum(CRC_8_PACKET, &packet) == 0 {
                    let wire = wire_crc(None, MessageType(packet[0]), &packet).unwrap();
                    assert_eq!(wire, CRC_ZERO_SUBSTITUTE);
                    found = true;
                }
            }
        }
        assert!(found, "no two-byte packet with a zero CRC exists");
    }

    #[test]
    fn addressed_frames_carry_the_address_byte() {
        let broadcast = DeviceShared::unsynced(BROADCAST_ADDRESS);
        let frame = build_frame(&broadcast, &[MessageType::PING.0, 0x01]).unwrap();
        assert_eq!(&frame[..2], &[SYNC_BYTE, 2]);

        let addressed = DeviceShared::unsynced(0x07);
        let frame = build_frame(&addressed, &[MessageType::PING.0, 0x01]).unwrap();
        assert_eq!(&frame[..3], &[SYNC_BYTE, 0x07, 2]);
    }

    #[test]
    fn frame_length_limits_are_enforced() {
        let device = DeviceShared::unsynced(BROADCAST_ADDRESS);
        assert!(matches!(
            build_frame(&device, &[]),
            Err(BusError::ProtocolFormat(_))
        ));
        assert!(matches!(
            build_frame(&device, &vec![0x01; 256]),
            Err(BusError::ProtocolFormat(_))
        ));
        assert!(build_frame(&device, &vec![0x01; 255]).is_ok());
    }
}
