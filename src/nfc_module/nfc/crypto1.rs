//! Crypto-1, the stream cipher of MIFARE Classic tags, and the 16 bit
//! LFSR the tags use to generate their nonces.
//!
//! The 48 bit register is kept as two 24 bit halves, `odd` holding the bits
//! at odd positions and `even` the bits at even positions. The filter only
//! ever looks at the odd half, so clocking the register is a swap of the
//! halves plus one new feedback bit.
//!
//! Words are processed big-endian byte by byte, each byte LSB first, which is
//! the order the bits travel over the air.

const LF_POLY_ODD: u32 = 0x29CE5C;
const LF_POLY_EVEN: u32 = 0x870804;

/// Period of the tag PRNG.
pub const PRNG_PERIOD: u32 = 65535;

#[inline]
fn bit(x: u64, n: u32) -> u32 {
    ((x >> n) & 1) as u32
}

#[inline]
fn parity32(x: u32) -> u32 {
    x.count_ones() & 1
}

/// Odd parity bit of a byte, as transmitted after every byte on the wire.
#[inline]
pub fn odd_parity8(x: u8) -> u8 {
    ((x.count_ones() + 1) & 1) as u8
}

/// Nonlinear filter over 20 bits of the odd register half.
#[inline]
fn filter(x: u32) -> u8 {
    let mut f = (0xf22c0 >> (x & 0xf)) & 16;
    f |= (0x6c9c0 >> ((x >> 4) & 0xf)) & 8;
    f |= (0x3c8b0 >> ((x >> 8) & 0xf)) & 4;
    f |= (0x1e458 >> ((x >> 12) & 0xf)) & 2;
    f |= (0x0d938 >> ((x >> 16) & 0xf)) & 1;
    ((0xEC57E80Au32 >> f) & 1) as u8
}

pub struct Crypto1 {
    odd: u32,
    even: u32,
}

impl Crypto1 {
    /// Load a 48 bit key into the register.
    pub fn new(key: u64) -> Self {
        let mut odd = 0u32;
        let mut even = 0u32;
        for i in (1..48u32).rev().step_by(2) {
            odd = odd << 1 | bit(key, (i - 1) ^ 7);
            even = even << 1 | bit(key, i ^ 7);
        }
        Crypto1 { odd, even }
    }

    /// A register that holds no key material.
    pub fn empty() -> Self {
        Crypto1 { odd: 0, even: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.odd == 0 && self.even == 0
    }

    /// Clock the register once and return the keystream bit.
    ///
    /// `input` is shifted into the feedback. With `is_encrypted` the input is
    /// a ciphertext bit and the keystream bit is removed from it first, so
    /// the register sees the plaintext bit.
    pub fn bit(&mut self, input: u8, is_encrypted: bool) -> u8 {
        let ret = filter(self.odd);

        let mut feedin = (ret & is_encrypted as u8) as u32;
        feedin ^= (input != 0) as u32;
        feedin ^= LF_POLY_ODD & self.odd;
        feedin ^= LF_POLY_EVEN & self.even;
        self.even = self.even << 1 | parity32(feedin);

        std::mem::swap(&mut self.odd, &mut self.even);

        ret
    }

    pub fn byte(&mut self, input: u8, is_encrypted: bool) -> u8 {
        let mut ret = 0u8;
        for i in 0..8 {
            ret |= self.bit((input >> i) & 1, is_encrypted) << i;
        }
        ret
    }

    pub fn word(&mut self, input: u32, is_encrypted: bool) -> u32 {
        let mut ret = 0u32;
        for i in 0..32 {
            let pos = i ^ 24;
            ret |= (self.bit(((input >> pos) & 1) as u8, is_encrypted) as u32) << pos;
        }
        ret
    }

    /// The keystream bit the next clock will produce. Encrypted parity bits
    /// are masked with it.
    pub fn peek_filter(&self) -> u8 {
        filter(self.odd)
    }

    /// Encrypt `data` in place with fresh keystream, returning the encrypted
    /// parity bits of the plaintext.
    pub fn encrypt_frame(&mut self, data: &mut [u8]) -> Vec<bool> {
        data.iter_mut()
            .map(|b| {
                let plain = *b;
                *b = self.byte(0, false) ^ plain;
                (self.peek_filter() ^ odd_parity8(plain)) != 0
            })
            .collect()
    }

    /// Decrypt `data` in place with fresh keystream.
    pub fn decrypt_frame(&mut self, data: &mut [u8]) {
        for b in data.iter_mut() {
            *b ^= self.byte(0, false);
        }
    }

    /// Zero the register.
    pub fn wipe(&mut self) {
        self.odd = 0;
        self.even = 0;
    }
}

impl Drop for Crypto1 {
    fn drop(&mut self) {
        self.wipe();
    }
}

/// Recover the cleartext of a nonce received during a nested
/// authentication, given the key of the requested sector.
pub fn decrypt_nonce(key: u64, cuid: u32, nt_enc: u32) -> u32 {
    let mut cipher = Crypto1::new(key);
    cipher.word(nt_enc ^ cuid, true) ^ nt_enc
}

/// Advance a tag nonce by `n` PRNG steps.
pub fn prng_successor(x: u32, n: u32) -> u32 {
    let mut x = x.swap_bytes();
    for _ in 0..n {
        x = x >> 1 | ((x >> 16 ^ x >> 18 ^ x >> 19 ^ x >> 21) & 1) << 31;
    }
    x.swap_bytes()
}

/// Step a tag nonce back by `n` PRNG steps.
pub fn prng_predecessor(x: u32, n: u32) -> u32 {
    let mut x = x.swap_bytes();
    for _ in 0..n {
        x = x << 1 | ((x >> 15 ^ x >> 1 ^ x >> 2 ^ x >> 4) & 1);
    }
    x.swap_bytes()
}

lazy_static::lazy_static! {
    /// Position of every 16 bit PRNG state in the sequence, indexed by the
    /// upper half of a nonce.
    static ref PRNG_POSITION: Vec<u16> = {
        let mut table = vec![0u16; 1 << 16];
        let mut x: u16 = 1;
        for i in 1..=u16::MAX {
            table[((x & 0xff) << 8 | x >> 8) as usize] = i;
            x = x >> 1 | ((x ^ x >> 2 ^ x >> 3 ^ x >> 5) & 1) << 15;
        }
        table
    };
}

/// Number of PRNG steps from `from` to `to`, modulo the PRNG period.
pub fn nonce_distance(from: u32, to: u32) -> u32 {
    let from = PRNG_POSITION[(from >> 16) as usize] as u32;
    let to = PRNG_POSITION[(to >> 16) as usize] as u32;
    (PRNG_PERIOD + to - from) % PRNG_PERIOD
}

/// Move a nonce back by a distance obtained from `nonce_distance`.
pub fn rewind_nonce(nt: u32, distance: u32) -> u32 {
    prng_predecessor(nt, distance % PRNG_PERIOD)
}

#[cfg(test)]
mod tests {
    use super::*;

    // reference trace of the mfkey64 tool, key FF FF FF FF FF FF
    const UID: u32 = 0x9c599b32;
    const NT: u32 = 0x82a4166c;
    const NR_ENC: u32 = 0xa1e458ce;
    const AR_ENC: u32 = 0x6eea41e0;
    const AT_ENC: u32 = 0x5cadf439;

    #[test]
    fn key_load() {
        let cipher = Crypto1::new(0xA0A1A2A3A4A5);
        assert_eq!(cipher.odd, 0x33bb33);
        assert_eq!(cipher.even, 0x08084c);
    }

    #[test]
    fn reference_trace() {
        let mut cipher = Crypto1::new(0xFFFFFFFFFFFF);
        assert_eq!(cipher.word(UID ^ NT, false), 0xff77ff5a);
        cipher.word(NR_ENC, true);
        assert_eq!(cipher.word(0, false) ^ prng_successor(NT, 64), AR_ENC);
        assert_eq!(cipher.word(0, false) ^ prng_successor(NT, 96), AT_ENC);
    }

    #[test]
    fn same_key_same_keystream() {
        let mut a = Crypto1::new(0x4D3A99C351DD);
        let mut b = Crypto1::new(0x4D3A99C351DD);
        for _ in 0..16 {
            assert_eq!(a.word(0x01020304, false), b.word(0x01020304, false));
        }
    }

    #[test]
    fn self_synchronizing_round_trip() {
        let key = 0x1A982C7E459A;
        let plain = [0x30u8, 0x04, 0x26, 0xEE, 0x00, 0xFF];

        // encrypting side shifts the plaintext into the register
        let mut encrypt = Crypto1::new(key);
        let cipher_text: Vec<u8> = plain.iter().map(|b| encrypt.byte(*b, false) ^ b).collect();

        // decrypting side shifts the ciphertext and removes the keystream
        let mut decrypt = Crypto1::new(key);
        let recovered: Vec<u8> = cipher_text
            .iter()
            .map(|b| decrypt.byte(*b, true) ^ b)
            .collect();

        assert_eq!(recovered, plain);
        assert_eq!(encrypt.odd, decrypt.odd);
        assert_eq!(encrypt.even, decrypt.even);
    }

    #[test]
    fn frames_round_trip() {
        let mut reader = Crypto1::new(0xFFFFFFFFFFFF);
        let mut tag = Crypto1::new(0xFFFFFFFFFFFF);

        let mut frame = hex!("30 04 26 EE");
        let parity = reader.encrypt_frame(&mut frame);
        assert_eq!(parity.len(), 4);
        tag.decrypt_frame(&mut frame);
        assert_eq!(frame, hex!("30 04 26 EE"));
    }

    #[test]
    fn nested_nonce_decryption() {
        let key = 0xFFFFFFFFFFFF;
        let mut tag = Crypto1::new(key);
        let nt_enc = NT ^ tag.word(UID ^ NT, false);
        assert_eq!(decrypt_nonce(key, UID, nt_enc), NT);
    }

    #[test]
    fn wipe_clears_state() {
        let mut cipher = Crypto1::new(0xFFFFFFFFFFFF);
        assert!(!cipher.is_empty());
        cipher.wipe();
        assert!(cipher.is_empty());
    }

    #[test]
    fn prng_steps() {
        assert_eq!(prng_successor(NT, 32), 0xf1913cc3);
        assert_eq!(prng_successor(NT, 64), 0x8d65734b);
        assert_eq!(prng_successor(NT, 96), 0x9a427b20);
        assert_eq!(prng_successor(NT, 0), NT);
        assert_eq!(prng_predecessor(prng_successor(NT, 1000), 1000), NT);
    }

    #[test]
    fn distance_matches_successor() {
        for n in [0u32, 1, 160, 840, 1199, 65534] {
            assert_eq!(nonce_distance(NT, prng_successor(NT, n)), n);
        }
        assert_eq!(nonce_distance(prng_successor(NT, 1), NT), PRNG_PERIOD - 1);
        assert_eq!(prng_successor(NT, PRNG_PERIOD), NT);
    }

    #[test]
    fn rewind_undoes_distance() {
        let first = prng_successor(NT, 5000);
        let nested = prng_successor(first, 417);
        let next_first = prng_successor(nested, 417);
        let dist = nonce_distance(nested, next_first);
        assert_eq!(rewind_nonce(next_first, dist), nested);
    }

    #[test]
    fn parity() {
        assert_eq!(odd_parity8(0x00), 1);
        assert_eq!(odd_parity8(0x01), 0);
        assert_eq!(odd_parity8(0xFF), 1);
        assert_eq!(odd_parity8(0x82), 1);
    }
}
