//! buslet: protocol engines for serial device buses.
//!
//! Two layers, both speaking to the outside world through the
//! [`SerialPort`] collaborator:
//!
//! - [`framer`] — an HDLC-style start/end/escape streaming codec with
//!   configurable escape/ignore tables, CRC discipline and statistics.
//! - [`packet`] — an addressed command/reply protocol with a
//!   single-outstanding-command dispatch loop, device sync handshake and
//!   per-device CRC tagging.

pub mod crc;
pub mod framer;
pub mod packet;
pub mod port;

pub use crc::{Crc, CrcParams, CRC_16_XMODEM, CRC_32, CRC_8_PACKET, CRC_NONE};
pub use framer::{FrameMeta, FrameSink, Framer, FramerConfig, FramerConfigError, FramerStats};
pub use framer::hdlc::HdlcFramer;
pub use packet::{Bus, BusConfig, BusError, Device, MessageType};
pub use port::{loopback, PipePort, SerialPort, StreamPort};
