use std::fmt;

use log::info;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::iso14443a::{
    CMD_AUTH_KEY_A, CMD_AUTH_KEY_B, CMD_BACKDOOR_AUTH_KEY_A, CMD_BACKDOOR_AUTH_KEY_B,
};
use super::utils::*;

pub const KEY_LENGTH: usize = 6;
pub const BLOCK_SIZE: usize = 16;
/// Largest supported card (MIFARE Classic 4K).
pub const MAX_SECTORS: usize = 40;

/// 48 bit sector key, written as 12 hex digits on the host channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key([u8; KEY_LENGTH]);

impl Key {
    pub const DEFAULT: Key = Key(hex!("FF FF FF FF FF FF"));

    pub const fn new(bytes: [u8; KEY_LENGTH]) -> Self {
        Key(bytes)
    }

    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; KEY_LENGTH];
        bytes.copy_from_slice(&value.to_be_bytes()[2..]);
        Key(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> NfcResult<Self> {
        let bytes = <[u8; KEY_LENGTH]>::try_from(bytes).map_err(|_| NfcError::ByteParseError)?;
        Ok(Key(bytes))
    }

    pub fn to_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, b| acc << 8 | *b as u64)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

impl TryFrom<String> for Key {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let digits: String = value.chars().filter(|c| !c.is_whitespace()).collect();
        if !digits.is_ascii() || digits.len() != KEY_LENGTH * 2 {
            return Err(format!("Key '{value}' must have {} hex digits", KEY_LENGTH * 2));
        }

        let mut bytes = [0u8; KEY_LENGTH];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)
                .map_err(|_| format!("Key '{value}' is not hex"))?;
        }
        Ok(Key(bytes))
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    A,
    B,
    /// Vendor backdoor authentication with key A semantics.
    BackdoorA,
    /// Vendor backdoor authentication with key B semantics.
    BackdoorB,
}

impl KeyType {
    pub fn command(&self) -> u8 {
        match self {
            KeyType::A => CMD_AUTH_KEY_A,
            KeyType::B => CMD_AUTH_KEY_B,
            KeyType::BackdoorA => CMD_BACKDOOR_AUTH_KEY_A,
            KeyType::BackdoorB => CMD_BACKDOOR_AUTH_KEY_B,
        }
    }

    pub fn from_command(command: u8) -> Option<Self> {
        match command {
            CMD_AUTH_KEY_A => Some(KeyType::A),
            CMD_AUTH_KEY_B => Some(KeyType::B),
            CMD_BACKDOOR_AUTH_KEY_A => Some(KeyType::BackdoorA),
            CMD_BACKDOOR_AUTH_KEY_B => Some(KeyType::BackdoorB),
            _ => None,
        }
    }

    /// 0 for the A slot, 1 for the B slot.
    pub fn index(&self) -> usize {
        match self {
            KeyType::A | KeyType::BackdoorA => 0,
            KeyType::B | KeyType::BackdoorB => 1,
        }
    }

    pub fn is_backdoor(&self) -> bool {
        matches!(self, KeyType::BackdoorA | KeyType::BackdoorB)
    }

    pub fn backdoor(&self) -> Self {
        match self.index() {
            0 => KeyType::BackdoorA,
            _ => KeyType::BackdoorB,
        }
    }
}

/// Sectors below 32 have 4 blocks, the upper 8 sectors of a 4K card 16.
pub fn sector_of_block(block: u8) -> u8 {
    if block < 128 {
        block / 4
    } else {
        32 + (block - 128) / 16
    }
}

pub fn first_block_of_sector(sector: u8) -> u8 {
    if sector < 32 {
        sector * 4
    } else {
        128 + (sector - 32) * 16
    }
}

pub fn blocks_in_sector(sector: u8) -> u8 {
    if sector < 32 {
        4
    } else {
        16
    }
}

pub fn trailer_block(sector: u8) -> u8 {
    first_block_of_sector(sector) + blocks_in_sector(sector) - 1
}

pub fn is_trailer_block(block: u8) -> bool {
    trailer_block(sector_of_block(block)) == block
}

/// Fresh reader nonce for the second pass of an authentication.
pub fn reader_nonce() -> u32 {
    rand::thread_rng().gen()
}

#[allow(non_snake_case)]
pub fn crc_checksum(value: &[u8]) -> [u8; 2] {
    let mut wCrc = 0x6363;
    for b in value {
        let br = ((wCrc & 0xFF) as u8) ^ b;
        let br = br ^ (br << 4);
        let br_long = br as u32;
        wCrc = (wCrc >> 8) ^ (br_long << 8) ^ (br_long << 3) ^ (br_long >> 4);
    }

    [((wCrc) & 0xFF) as u8, ((wCrc >> 8) & 0xFF) as u8]
}

#[test]
pub fn crc_test() {
    let x = hex!("00 00");
    let crc = crc_checksum(&x);

    info!("{:X?}", x);
    info!("{:X?}", crc);
    assert_eq!(crc, hex!("A0 1E"));

    let x = hex!("12 34");
    let crc = crc_checksum(&x);

    info!("{:X?}", x);
    info!("{:X?}", crc);
    assert_eq!(crc, hex!("26 CF"));

    let x = hex!("30 00");
    assert_eq!(crc_checksum(&x), hex!("02 A8"));
}

#[test]
pub fn sector_layout_test() {
    assert_eq!(first_block_of_sector(0), 0);
    assert_eq!(trailer_block(0), 3);
    assert_eq!(trailer_block(15), 63);
    assert_eq!(trailer_block(31), 127);
    assert_eq!(first_block_of_sector(32), 128);
    assert_eq!(trailer_block(32), 143);
    assert_eq!(trailer_block(39), 255);
    assert_eq!(sector_of_block(130), 32);
    assert_eq!(sector_of_block(7), 1);
    assert!(is_trailer_block(143));
    assert!(!is_trailer_block(131));
    assert!(is_trailer_block(7));
}

#[test]
pub fn key_test() {
    let key = Key::try_from("a0a1a2a3a4a5".to_owned()).unwrap();
    assert_eq!(key.to_u64(), 0xA0A1A2A3A4A5);
    assert_eq!(key, Key::from_u64(0xA0A1A2A3A4A5));
    assert_eq!(String::from(key), "A0A1A2A3A4A5");
    assert_eq!(Key::try_from("A0 A1 A2 A3 A4 A5".to_owned()), Ok(key));
    assert!(Key::try_from("A0A1".to_owned()).is_err());
    assert!(Key::try_from("ZZA1A2A3A4A5".to_owned()).is_err());
    assert!(Key::from_u64(0).is_zero());

    let json = serde_json::to_string(&Key::DEFAULT).unwrap();
    assert_eq!(json, "\"FFFFFFFFFFFF\"");
    assert_eq!(serde_json::from_str::<Key>(&json).unwrap(), Key::DEFAULT);
}

#[test]
pub fn key_type_test() {
    assert_eq!(KeyType::A.command(), 0x60);
    assert_eq!(KeyType::BackdoorB.command(), 0x65);
    assert_eq!(KeyType::from_command(0x61), Some(KeyType::B));
    assert_eq!(KeyType::from_command(0x30), None);
    assert_eq!(KeyType::B.backdoor(), KeyType::BackdoorB);
    assert_eq!(KeyType::BackdoorB.index(), 1);
}
