//! Device handles on a packet bus.
//!
//! A device is a lightweight address plus sync state; the bus owns the
//! port and dispatch loop. Devices become usable for tagged commands after
//! [`Device::connect`] establishes sync: three exact ping echoes and a
//! serial fetch, whose XOR-fold tags this device's CRCs from then on.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::sync::oneshot;

use super::{BusError, BusShared, Command, MessageType, DEFAULT_COMMAND_TIMEOUT};

pub(crate) struct SyncState {
    pub(crate) synced: bool,
    pub(crate) full_serial: Option<Vec<u8>>,
    pub(crate) compressed_serial: u8,
}

pub(crate) struct DeviceShared {
    pub(crate) address: u8,
    sync: Mutex<SyncState>,
}

impl DeviceShared {
    pub(crate) fn unsynced(address: u8) -> Self {
        Self {
            address,
            sync: Mutex::new(SyncState {
                synced: false,
                full_serial: None,
                compressed_serial: 0,
            }),
        }
    }

    pub(crate) fn lock_sync(&self) -> MutexGuard<'_, SyncState> {
        self.sync.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to one device on the bus.
pub struct Device {
    bus: Arc<BusShared>,
    shared: Arc<DeviceShared>,
}

impl Device {
    pub(crate) fn new(bus: Arc<BusShared>, address: u8) -> Self {
        Self {
            bus,
            shared: Arc::new(DeviceShared::unsynced(address)),
        }
    }

    pub fn address(&self) -> u8 {
        self.shared.address
    }

    pub fn is_synced(&self) -> bool {
        self.shared.lock_sync().synced
    }

    /// XOR-fold of the device serial, used to tag this device's CRCs.
    pub fn compressed_serial(&self) -> u8 {
        self.shared.lock_sync().compressed_serial
    }

    /// Queues one command and waits for its reply.
    ///
    /// `timeout` of `None` marks the command unsolicited: it completes as
    /// soon as the bus has written it, with an empty reply. Replies arrive
    /// in command order; a missing reply becomes [`BusError::Timeout`].
    pub async fn send_command(
        &self,
        msg_type: MessageType,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, BusError> {
        let mut packet = Vec::with_capacity(1 + payload.len());
        packet.push(msg_type.0);
        packet.extend_from_slice(payload);

        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command {
            device: Arc::clone(&self.shared),
            packet,
            timeout,
            reply_tx,
        };

        self.bus
            .cmd_tx
            .send(command)
            .await
            .map_err(|_| BusError::Closed)?;
        reply_rx.await.map_err(|_| BusError::Closed)?
    }

    /// Fetches the device serial: the raw identity before sync, the hashed
    /// variant once synced.
    pub async fn serial(&self) -> Result<Vec<u8>, BusError> {
        let synced = self.shared.lock_sync().synced;
        let msg_type = if synced {
            MessageType::ID_HASH
        } else {
            MessageType::ID
        };
        self.send_command(msg_type, &[], Some(DEFAULT_COMMAND_TIMEOUT))
            .await
    }

    async fn sync_try(&self) -> Result<(), BusError> {
        for _ in 0..3 {
            let challenge = {
                let mut rng = rand::rng();
                let len = rng.random_range(8..=16);
                let mut buf = vec![0u8; len];
                rng.fill(&mut buf[..]);
                buf
            };

            let echo = self
                .send_command(MessageType::PING, &challenge, Some(DEFAULT_COMMAND_TIMEOUT))
                .await?;
            if echo != challenge {
                return Err(BusError::SyncFailed);
            }
        }
        Ok(())
    }

    /// Establishes sync: up to three rounds of the triple ping handshake,
    /// then a serial fetch. On success the device is marked synced and its
    /// compressed serial tags subsequent CRCs.
    pub async fn connect(&self) -> Result<Vec<u8>, BusError> {
        self.shared.lock_sync().synced = false;

        let mut last_err = None;
        for _ in 0..3 {
            match self.sync_try().await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(err) => last_err = Some(err),
            }
        }
        if let Some(err) = last_err {
            tracing::debug!(address = self.shared.address, error = %err, "sync failed");
            return Err(err);
        }

        let serial = self.serial().await?;
        let compressed = serial.iter().fold(0u8, |acc, &b| acc ^ b);

        let mut sync = self.shared.lock_sync();
        sync.compressed_serial = compressed;
        sync.full_serial = Some(serial.clone());
        sync.synced = true;
        drop(sync);

        tracing::debug!(
            address = self.shared.address,
            compressed_serial = compressed,
            "device synced"
        );
        Ok(serial)
    }

    /// Re-fetches the serial and compares against the cached one. Returns
    /// [`BusError::Nack`] on mismatch and [`BusError::NotConnected`] if the
    /// device was never synced.
    pub async fn test_comm(&self) -> Result<(), BusError> {
        let reported = self.serial().await?;

        let cached = {
            let sync = self.shared.lock_sync();
            if sync.synced {
                sync.full_serial.clone()
            } else {
                None
            }
        };

        match cached {
            None => Err(BusError::NotConnected),
            Some(cached) if cached != reported => Err(BusError::Nack),
            Some(_) => Ok(()),
        }
    }

    /// Queries the device clock. Devices answer with 4 or 8 big-endian
    /// bytes; 0 means the query is unsupported.
    pub async fn system_time(&self) -> Result<u64, BusError> {
        let reply = self
            .send_command(MessageType::SYS_TIME, &[], Some(DEFAULT_COMMAND_TIMEOUT))
            .await?;

        match reply.len() {
            4 => {
                let value = u32::from_be_bytes(reply[..4].try_into().expect("length checked"));
                Ok(u64::from(value))
            }
            8 => Ok(u64::from_be_bytes(
                reply[..8].try_into().expect("length checked"),
            )),
            _ => Ok(0),
        }
    }
}
