use super::crypto1::odd_parity8;
use super::mifare_utils::crc_checksum;

pub const CMD_AUTH_KEY_A: u8 = 0x60;
pub const CMD_AUTH_KEY_B: u8 = 0x61;
pub const CMD_BACKDOOR_AUTH_KEY_A: u8 = 0x64;
pub const CMD_BACKDOOR_AUTH_KEY_B: u8 = 0x65;
pub const CMD_READ_BLOCK: u8 = 0x30;
pub const CMD_HALT: [u8; 2] = hex!("50 00");

pub const MAGIC_WUPC1: u8 = 0x40;
pub const MAGIC_WUPC2: u8 = 0x43;
pub const MAGIC_GDM_WUPC1: u8 = 0x20;
pub const MAGIC_GDM_WUPC2: u8 = 0x23;

pub const ACK: u8 = 0x0A;
pub const NAK: u8 = 0x04;

/// Ticks of the reader clock per transmitted bit.
pub const TICKS_PER_BIT: u32 = 8;
/// Delay between the end of a reader frame and the tag answer.
pub const FRAME_DELAY_TIME: u32 = 74;
/// Default frame waiting time.
pub const FRAME_WAIT_TIME: u32 = 4096;
/// A tag stops waiting for the reader answer 1ms after the nonce was sent.
pub const AUTHENTICATION_TIMEOUT: u32 = 848;
/// Some cards need a pause after select before the first authentication.
pub const PRE_AUTHENTICATION_LEADTIME: u32 = 400;

/// Single reader or tag frame with its parity bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub parity: Vec<bool>,
    /// Number of valid bits in the last byte. Short frames carry no parity.
    pub last_bits: u8,
}

impl Frame {
    /// Plain frame with odd parity.
    pub fn new(data: Vec<u8>) -> Self {
        let parity = data.iter().map(|b| odd_parity8(*b) != 0).collect();
        Self {
            data,
            parity,
            last_bits: 8,
        }
    }

    /// Plain frame with CRC_A appended.
    pub fn with_crc(data: &[u8]) -> Self {
        let mut data = data.to_vec();
        append_crc(&mut data);
        Self::new(data)
    }

    pub fn encrypted(data: Vec<u8>, parity: Vec<bool>) -> Self {
        Self {
            data,
            parity,
            last_bits: 8,
        }
    }

    /// Frame of less than 8 bits, like REQA or the magic wakeups.
    pub fn short(value: u8, bits: u8) -> Self {
        Self {
            data: vec![value & ((1u16 << bits) - 1) as u8],
            parity: Vec::new(),
            last_bits: bits,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_short(&self) -> bool {
        self.last_bits < 8
    }

    pub fn bit_len(&self) -> u32 {
        if self.is_short() {
            self.last_bits as u32
        } else {
            self.data.len() as u32 * 9
        }
    }

    pub fn duration(&self) -> u32 {
        self.bit_len() * TICKS_PER_BIT
    }

    /// First 8 parity bits packed MSB first, byte 0 in bit 7.
    pub fn parity_byte(&self) -> u8 {
        self.parity
            .iter()
            .take(8)
            .enumerate()
            .fold(0u8, |acc, (i, p)| acc | ((*p as u8) << (7 - i)))
    }

    pub fn is_ack(&self) -> bool {
        self.last_bits == 4 && self.data.first().map(|b| b & 0x0F) == Some(ACK)
    }

    pub fn has_valid_crc(&self) -> bool {
        check_crc(&self.data)
    }
}

pub fn append_crc(data: &mut Vec<u8>) {
    let crc = crc_checksum(data);
    data.extend_from_slice(&crc);
}

pub fn check_crc(data: &[u8]) -> bool {
    if data.len() < 3 {
        return false;
    }
    let (payload, crc) = data.split_at(data.len() - 2);
    crc_checksum(payload) == crc
}
