//! Parametric CRC engine.
//!
//! One bitwise implementation covers every width from 1 to 64 bits, with
//! optional input/output reflection and a final XOR. Device protocols in
//! this crate pick their parameter set at configuration time; the framer
//! serializes multi-byte results little-endian on the wire.

use serde::Serialize;

/// CRC parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CrcParams {
    /// Register width in bits (0 disables the CRC entirely).
    pub width: u8,
    pub poly: u64,
    pub init: u64,
    pub reflect_in: bool,
    pub reflect_out: bool,
    pub xor_out: u64,
}

/// Disabled CRC: zero result bytes on the wire.
pub const CRC_NONE: CrcParams = CrcParams {
    width: 0,
    poly: 0,
    init: 0,
    reflect_in: false,
    reflect_out: false,
    xor_out: 0,
};

/// CRC-8 used by the packet protocol bus.
pub const CRC_8_PACKET: CrcParams = CrcParams {
    width: 8,
    poly: 0x9B,
    init: 0x12,
    reflect_in: false,
    reflect_out: false,
    xor_out: 0,
};

/// CRC-16/XMODEM.
pub const CRC_16_XMODEM: CrcParams = CrcParams {
    width: 16,
    poly: 0x1021,
    init: 0,
    reflect_in: false,
    reflect_out: false,
    xor_out: 0,
};

/// CRC-32 (ISO-HDLC).
pub const CRC_32: CrcParams = CrcParams {
    width: 32,
    poly: 0x04C1_1DB7,
    init: 0xFFFF_FFFF,
    reflect_in: true,
    reflect_out: true,
    xor_out: 0xFFFF_FFFF,
};

impl CrcParams {
    /// Number of bytes the result occupies on the wire.
    pub const fn result_len(&self) -> usize {
        if self.width == 0 {
            0
        } else {
            (self.width as usize - 1) / 8 + 1
        }
    }

    fn mask(&self) -> u64 {
        if self.width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.width) - 1
        }
    }
}

fn reflect(value: u64, bits: u8) -> u64 {
    value.reverse_bits() >> (64 - bits as u32)
}

/// Streaming CRC accumulator.
#[derive(Debug, Clone)]
pub struct Crc {
    params: CrcParams,
    value: u64,
}

impl Crc {
    pub fn new(params: CrcParams) -> Self {
        Self {
            params,
            value: params.init & params.mask(),
        }
    }

    pub fn params(&self) -> CrcParams {
        self.params
    }

    pub fn reset(&mut self) -> &mut Self {
        self.value = self.params.init & self.params.mask();
        self
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        if self.params.width == 0 {
            return self;
        }

        let top = 1u64 << (self.params.width - 1);
        let mask = self.params.mask();

        for &byte in data {
            let byte = if self.params.reflect_in {
                byte.reverse_bits()
            } else {
                byte
            };

            for bit in (0..8).rev() {
                let incoming = (byte >> bit) & 1 == 1;
                let top_set = self.value & top != 0;
                self.value = (self.value << 1) & mask;
                if top_set ^ incoming {
                    self.value ^= self.params.poly & mask;
                }
            }
        }

        self
    }

    /// Final CRC value with reflection and XOR applied.
    pub fn result(&self) -> u64 {
        if self.params.width == 0 {
            return 0;
        }
        let mut value = self.value;
        if self.params.reflect_out {
            value = reflect(value, self.params.width);
        }
        (value ^ self.params.xor_out) & self.params.mask()
    }

    pub const fn result_len(&self) -> usize {
        self.params.result_len()
    }

    /// Serializes the result little-endian into `out`, returning the slice
    /// actually used (`result_len` bytes).
    pub fn result_bytes_le<'a>(&self, out: &'a mut [u8; 8]) -> &'a [u8] {
        let mut value = self.result();
        let len = self.result_len();
        for byte in out.iter_mut().take(len) {
            *byte = value as u8;
            value >>= 8;
        }
        &out[..len]
    }
}

/// One-shot checksum over `data`.
pub fn checksum(params: CrcParams, data: &[u8]) -> u64 {
    let mut crc = Crc::new(params);
    crc.update(data);
    crc.result()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECK_INPUT: &[u8] = b"123456789";

    #[test]
    fn crc16_xmodem_check_value() {
        assert_eq!(checksum(CRC_16_XMODEM, CHECK_INPUT), 0x31C3);
    }

    #[test]
    fn crc32_check_value() {
        assert_eq!(checksum(CRC_32, CHECK_INPUT), 0xCBF4_3926);
    }

    #[test]
    fn crc8_packet_empty_is_init() {
        assert_eq!(checksum(CRC_8_PACKET, &[]), 0x12);
    }

    #[test]
    fn crc8_packet_is_byte_sensitive() {
        let a = checksum(CRC_8_PACKET, &[0x01, 0x02, 0x03]);
        let b = checksum(CRC_8_PACKET, &[0x01, 0x02, 0x04]);
        let c = checksum(CRC_8_PACKET, &[0x02, 0x01, 0x03]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a <= 0xFF && b <= 0xFF && c <= 0xFF);
    }

    #[test]
    fn streaming_matches_one_shot() {
        let mut crc = Crc::new(CRC_32);
        crc.update(b"1234").update(b"56789");
        assert_eq!(crc.result(), checksum(CRC_32, CHECK_INPUT));

        crc.reset();
        crc.update(CHECK_INPUT);
        assert_eq!(crc.result(), checksum(CRC_32, CHECK_INPUT));
    }

    #[test]
    fn result_bytes_are_little_endian() {
        let mut crc = Crc::new(CRC_16_XMODEM);
        crc.update(CHECK_INPUT);
        let mut buf = [0u8; 8];
        assert_eq!(crc.result_bytes_le(&mut buf), &[0xC3, 0x31]);
    }

    #[test]
    fn crc_none_is_inert() {
        let mut crc = Crc::new(CRC_NONE);
        crc.update(CHECK_INPUT);
        assert_eq!(crc.result(), 0);
        assert_eq!(crc.result_len(), 0);
        let mut buf = [0u8; 8];
        assert!(crc.result_bytes_le(&mut buf).is_empty());
    }
}
