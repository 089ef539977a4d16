use std::collections::BTreeMap;

use log::trace;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::crypto1::{odd_parity8, prng_successor, Crypto1, PRNG_PERIOD};
use super::iso14443a::*;
use super::link_layer::{CardInfo, LinkLayer, Polling};
use super::mifare_utils::*;
use super::utils::*;

/// The tag PRNG shifts once per bit period.
pub const TICKS_PER_PRNG_STEP: u32 = 8;
/// Nonce taken from a recorded authentication, a valid PRNG output.
pub const REFERENCE_NONCE: u32 = 0x82a4166c;
/// Backdoor key of FM11RF08S tags.
pub const FM11RF08S_BACKDOOR_KEY: Key = Key::new(hex!("A3 96 EF A4 E2 4F"));

const SELECT_DURATION: u32 = 2400;
const FAST_SELECT_DURATION: u32 = 1100;
const DEFAULT_ACCESS_BITS: [u8; 4] = hex!("FF 07 80 69");

/// How the simulated tag chooses the nonce of each authentication.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum NonceModel {
    /// Free running PRNG, clocked since power up. Weak NXP tags.
    Clocked,
    /// PRNG advanced by a fixed number of steps per authentication.
    Sequential { step: u32 },
    /// Every authentication gets the same nonce.
    Static(u32),
    /// Nested authentications get `nested`, first ones its successor at
    /// `distance`. Hardened FM11RF08S tags.
    StaticEncrypted { nested: u32, distance: u32 },
    /// Unpredictable nonces of hardened tags.
    Random,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MagicWakeup {
    Gen1,
    Gdm,
}

impl MagicWakeup {
    fn commands(&self) -> (u8, u8) {
        match self {
            MagicWakeup::Gen1 => (MAGIC_WUPC1, MAGIC_WUPC2),
            MagicWakeup::Gdm => (MAGIC_GDM_WUPC1, MAGIC_GDM_WUPC2),
        }
    }
}

enum TagState {
    Idle,
    Halted,
    Active,
    Magic { unlocked: bool },
    AwaitAnswer { cipher: Crypto1, nt: u32, sector: u8 },
    Authenticated { cipher: Crypto1, sector: u8 },
}

/// MIFARE Classic tag in front of a simulated reader.
pub struct SimulationCard {
    card: CardInfo,
    blocks: BTreeMap<u8, [u8; BLOCK_SIZE]>,
    backdoor_key: Option<Key>,
    key_b_readable: bool,
    magic: Option<MagicWakeup>,
    nonce_model: NonceModel,
    rng: StdRng,
    prng_seed: u32,
    prng: u32,
    prng_position: u32,
    state: TagState,
    present: bool,
    remaining_authentications: Option<u32>,
    now: u32,
    power_on: u32,
    answer: Option<Frame>,
}

impl SimulationCard {
    /// Card with `sectors` sectors, transport keys and a clocked PRNG.
    pub fn new(uid: &[u8], sectors: u8, seed: u64) -> NfcResult<Self> {
        if sectors == 0 || sectors as usize > MAX_SECTORS {
            return Err(NfcError::InvalidArgument);
        }

        let card = CardInfo::new(uid.to_vec(), hex!("00 04"), 0x08)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let prng_seed = prng_successor(REFERENCE_NONCE, rng.gen_range(0..PRNG_PERIOD));

        let mut simulation = Self {
            card,
            blocks: BTreeMap::new(),
            backdoor_key: None,
            key_b_readable: false,
            magic: None,
            nonce_model: NonceModel::Clocked,
            rng,
            prng_seed,
            prng: prng_seed,
            prng_position: 0,
            state: TagState::Idle,
            present: true,
            remaining_authentications: None,
            now: 0,
            power_on: 0,
            answer: None,
        };

        for sector in 0..sectors {
            simulation.add_sector(sector);
        }
        let manufacturer = simulation.manufacturer_block();
        simulation.blocks.insert(0, manufacturer);

        Ok(simulation)
    }

    /// Named card setups used by the service binary.
    pub fn from_profile(profile: &str, seed: u64) -> NfcResult<Self> {
        let uid = hex!("9C 59 9B 32");
        let key_a = Key::new(hex!("A0 A1 A2 A3 A4 A5"));
        let key_b = Key::new(hex!("B0 B1 B2 B3 B4 B5"));

        let card = match profile {
            "classic" => {
                let mut card = Self::new(&uid, 16, seed)?.with_readable_key_b(true);
                for sector in 4..16 {
                    card = card.with_sector_keys(sector, key_a, key_b);
                }
                card
            }
            "static" => Self::new(&uid, 16, seed)?
                .with_nonce_model(NonceModel::Static(prng_successor(REFERENCE_NONCE, 4711))),
            "hardened" => Self::new(&uid, 16, seed)?
                .with_extended_region()
                .with_sector_keys(1, key_a, key_b)
                .with_backdoor_key(FM11RF08S_BACKDOOR_KEY)
                .with_nonce_model(NonceModel::StaticEncrypted {
                    nested: prng_successor(REFERENCE_NONCE, 1000),
                    distance: 397,
                }),
            "random" => Self::new(&uid, 16, seed)?.with_nonce_model(NonceModel::Random),
            "magic" => Self::new(&uid, 16, seed)?
                .with_magic_wakeup(MagicWakeup::Gen1)
                .with_sector_keys(2, key_a, key_b),
            _ => return Err(NfcError::InvalidArgument),
        };

        Ok(card)
    }

    pub fn with_sector_keys(mut self, sector: u8, key_a: Key, key_b: Key) -> Self {
        let mut trailer = Self::default_trailer();
        trailer[..KEY_LENGTH].copy_from_slice(key_a.as_bytes());
        trailer[10..].copy_from_slice(key_b.as_bytes());
        self.blocks.insert(trailer_block(sector), trailer);
        self
    }

    pub fn with_block(mut self, block: u8, data: [u8; BLOCK_SIZE]) -> Self {
        self.blocks.insert(block, data);
        self
    }

    pub fn with_nonce_model(mut self, nonce_model: NonceModel) -> Self {
        self.nonce_model = nonce_model;
        self
    }

    pub fn with_backdoor_key(mut self, key: Key) -> Self {
        self.backdoor_key = Some(key);
        self
    }

    pub fn with_readable_key_b(mut self, readable: bool) -> Self {
        self.key_b_readable = readable;
        self
    }

    pub fn with_magic_wakeup(mut self, magic: MagicWakeup) -> Self {
        self.magic = Some(magic);
        self
    }

    /// Advanced verification blocks of FM11RF08S tags, starting at block 128.
    pub fn with_extended_region(mut self) -> Self {
        self.add_sector(32);
        self
    }

    pub fn card_info(&self) -> &CardInfo {
        &self.card
    }

    pub fn key(&self, sector: u8, key_type: KeyType) -> Option<Key> {
        let trailer = self.blocks.get(&trailer_block(sector))?;
        let offset = if key_type.index() == 0 { 0 } else { 10 };
        Key::from_slice(&trailer[offset..offset + KEY_LENGTH]).ok()
    }

    pub fn block(&self, block: u8) -> Option<[u8; BLOCK_SIZE]> {
        self.blocks.get(&block).copied()
    }

    /// Nonce the tag answers to nested authentications, if it is fixed.
    pub fn nested_nonce(&self) -> Option<u32> {
        match self.nonce_model {
            NonceModel::Static(nonce) => Some(nonce),
            NonceModel::StaticEncrypted { nested, .. } => Some(nested),
            _ => None,
        }
    }

    pub fn remove(&mut self) {
        self.present = false;
        self.state = TagState::Idle;
    }

    pub fn insert(&mut self) {
        self.present = true;
        self.state = TagState::Idle;
        self.power_on = self.now;
        self.prng = self.prng_seed;
        self.prng_position = 0;
    }

    /// Start the reader clock at `ticks`, as if the field came up then.
    pub fn with_clock(mut self, ticks: u32) -> Self {
        self.now = ticks;
        self.power_on = ticks;
        self
    }

    /// Leave the field after `count` more authentication requests.
    pub fn remove_after(&mut self, count: u32) {
        self.remaining_authentications = Some(count);
    }

    fn default_trailer() -> [u8; BLOCK_SIZE] {
        let mut trailer = [0xFF; BLOCK_SIZE];
        trailer[6..10].copy_from_slice(&DEFAULT_ACCESS_BITS);
        trailer
    }

    fn add_sector(&mut self, sector: u8) {
        let first = first_block_of_sector(sector);
        let trailer = trailer_block(sector);
        for block in first..trailer {
            self.blocks.entry(block).or_insert([0; BLOCK_SIZE]);
        }
        self.blocks
            .entry(trailer)
            .or_insert_with(Self::default_trailer);
    }

    fn manufacturer_block(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        let uid = &self.card.uid;
        block[..uid.len()].copy_from_slice(uid);
        if uid.len() == 4 {
            block[4] = uid.iter().fold(0, |acc, b| acc ^ b);
            block[5] = self.card.sak;
            block[6] = self.card.atqa[1];
            block[7] = self.card.atqa[0];
        }
        block
    }

    /// Block contents as a reader sees them. Key A never leaves the tag.
    fn read_view(&self, block: u8, raw: bool) -> Option<[u8; BLOCK_SIZE]> {
        let mut data = *self.blocks.get(&block)?;
        if !raw && is_trailer_block(block) {
            data[..KEY_LENGTH].fill(0);
            if !self.key_b_readable {
                data[10..].fill(0);
            }
        }
        Some(data)
    }

    fn authentication_key(&self, key_type: KeyType, block: u8) -> Option<Key> {
        if !self.blocks.contains_key(&block) {
            return None;
        }
        if key_type.is_backdoor() {
            return self.backdoor_key;
        }
        self.key(sector_of_block(block), key_type)
    }

    fn next_nonce(&mut self, start: u32, nested: bool) -> u32 {
        match self.nonce_model {
            NonceModel::Clocked => {
                let position = start.wrapping_sub(self.power_on) / TICKS_PER_PRNG_STEP;
                let steps = position.saturating_sub(self.prng_position) % PRNG_PERIOD;
                self.prng = prng_successor(self.prng, steps);
                self.prng_position = position;
                self.prng
            }
            NonceModel::Sequential { step } => {
                self.prng = prng_successor(self.prng, step);
                self.prng
            }
            NonceModel::Static(nonce) => nonce,
            NonceModel::StaticEncrypted { nested: nonce, distance } => {
                if nested {
                    nonce
                } else {
                    prng_successor(nonce, distance)
                }
            }
            NonceModel::Random => self.rng.gen(),
        }
    }

    fn begin_authentication(
        &mut self,
        command: u8,
        block: u8,
        start: u32,
        nested: bool,
    ) -> (TagState, Option<Frame>) {
        if let Some(remaining) = self.remaining_authentications {
            if remaining == 0 {
                self.present = false;
                return (TagState::Idle, None);
            }
            self.remaining_authentications = Some(remaining - 1);
        }

        let key = match KeyType::from_command(command)
            .and_then(|key_type| self.authentication_key(key_type, block))
        {
            Some(key) => key,
            None => return (TagState::Idle, Some(Frame::short(NAK, 4))),
        };

        let nt = self.next_nonce(start, nested);
        let mut cipher = Crypto1::new(key.to_u64());
        let ks = cipher.word(self.card.cuid ^ nt, false);

        let answer = if nested {
            let plain = nt.to_be_bytes();
            let mut parity = Vec::with_capacity(4);
            for (i, byte) in plain.iter().enumerate() {
                let ks_bit = if i < 3 {
                    ((ks >> (16 - 8 * i)) & 1) as u8
                } else {
                    cipher.peek_filter()
                };
                parity.push((odd_parity8(*byte) ^ ks_bit) != 0);
            }
            Frame::encrypted((nt ^ ks).to_be_bytes().to_vec(), parity)
        } else {
            Frame::new(nt.to_be_bytes().to_vec())
        };

        trace!(
            "[SimulationCard] auth {:02X} block {} nested={} nt={:08x}",
            command,
            block,
            nested,
            nt
        );

        (
            TagState::AwaitAnswer {
                cipher,
                nt,
                sector: sector_of_block(block),
            },
            Some(answer),
        )
    }

    fn process(&mut self, frame: &Frame, start: u32) -> Option<Frame> {
        if !self.present {
            return None;
        }

        let state = std::mem::replace(&mut self.state, TagState::Idle);
        let (state, answer) = match state {
            TagState::Idle | TagState::Halted => self.process_sleeping(state, frame),
            TagState::Magic { unlocked } => self.process_magic(unlocked, frame),
            TagState::Active => self.process_plain(frame, start),
            TagState::AwaitAnswer { cipher, nt, sector } => {
                Self::process_reader_answer(cipher, nt, sector, frame)
            }
            TagState::Authenticated { cipher, sector } => {
                self.process_encrypted(cipher, sector, frame, start)
            }
        };
        self.state = state;
        answer
    }

    fn process_sleeping(&mut self, state: TagState, frame: &Frame) -> (TagState, Option<Frame>) {
        match self.magic {
            Some(magic)
                if frame.last_bits == 7 && frame.data.first() == Some(&magic.commands().0) =>
            {
                (TagState::Magic { unlocked: false }, Some(Frame::short(ACK, 4)))
            }
            _ => (state, None),
        }
    }

    fn process_magic(&mut self, unlocked: bool, frame: &Frame) -> (TagState, Option<Frame>) {
        let second = self.magic.map(|magic| magic.commands().1);
        if !unlocked && frame.data.len() == 1 && frame.data.first().copied() == second {
            return (TagState::Magic { unlocked: true }, Some(Frame::short(ACK, 4)));
        }
        if !frame.has_valid_crc() {
            return (TagState::Idle, None);
        }

        match frame.data[0] {
            CMD_READ_BLOCK if frame.len() == 4 => match self.read_view(frame.data[1], true) {
                Some(data) => (TagState::Magic { unlocked }, Some(Frame::with_crc(&data))),
                None => (TagState::Magic { unlocked }, Some(Frame::short(NAK, 4))),
            },
            _ if frame.data[..2] == CMD_HALT => (TagState::Halted, None),
            _ => (TagState::Idle, None),
        }
    }

    fn process_plain(&mut self, frame: &Frame, start: u32) -> (TagState, Option<Frame>) {
        if frame.is_short() || frame.len() != 4 || !frame.has_valid_crc() {
            return (TagState::Idle, None);
        }

        match frame.data[0] {
            command if KeyType::from_command(command).is_some() => {
                self.begin_authentication(command, frame.data[1], start, false)
            }
            _ if frame.data[..2] == CMD_HALT => (TagState::Halted, None),
            _ => (TagState::Idle, None),
        }
    }

    fn process_reader_answer(
        mut cipher: Crypto1,
        nt: u32,
        sector: u8,
        frame: &Frame,
    ) -> (TagState, Option<Frame>) {
        if frame.is_short() || frame.len() != 8 {
            return (TagState::Idle, None);
        }

        for b in &frame.data[..4] {
            cipher.byte(*b, true);
        }
        let ar = frame.data[4..]
            .iter()
            .fold(0u32, |acc, b| acc << 8 | (b ^ cipher.byte(0, false)) as u32);

        if ar != prng_successor(nt, 64) {
            trace!("[SimulationCard] reader answer rejected");
            return (TagState::Idle, None);
        }

        let mut at = prng_successor(nt, 96).to_be_bytes().to_vec();
        let parity = cipher.encrypt_frame(&mut at);

        (
            TagState::Authenticated { cipher, sector },
            Some(Frame::encrypted(at, parity)),
        )
    }

    fn process_encrypted(
        &mut self,
        mut cipher: Crypto1,
        sector: u8,
        frame: &Frame,
        start: u32,
    ) -> (TagState, Option<Frame>) {
        if frame.is_short() {
            return (TagState::Idle, None);
        }

        let mut data = frame.data.clone();
        cipher.decrypt_frame(&mut data);
        if data.len() != 4 || !check_crc(&data) {
            return (TagState::Idle, None);
        }

        match data[0] {
            command if KeyType::from_command(command).is_some() => {
                self.begin_authentication(command, data[1], start, true)
            }
            CMD_READ_BLOCK if sector_of_block(data[1]) == sector => {
                match self.read_view(data[1], false) {
                    Some(block) => {
                        let mut answer = block.to_vec();
                        append_crc(&mut answer);
                        let parity = cipher.encrypt_frame(&mut answer);
                        (
                            TagState::Authenticated { cipher, sector },
                            Some(Frame::encrypted(answer, parity)),
                        )
                    }
                    None => (TagState::Idle, None),
                }
            }
            _ if data[..2] == CMD_HALT => (TagState::Halted, None),
            _ => (TagState::Idle, None),
        }
    }
}

impl LinkLayer for SimulationCard {
    fn select(&mut self, polling: Polling) -> NfcResult<CardInfo> {
        self.now = self.now.wrapping_add(SELECT_DURATION);
        self.answer = None;

        if !self.present {
            return Err(NfcError::SelectFailure);
        }
        if polling == Polling::Reqa && matches!(self.state, TagState::Halted) {
            return Err(NfcError::SelectFailure);
        }

        self.state = TagState::Active;
        Ok(self.card.clone())
    }

    fn fast_reselect(&mut self, uid: &[u8], cascade_levels: u8) -> bool {
        self.now = self.now.wrapping_add(FAST_SELECT_DURATION);
        self.answer = None;

        if !self.present || uid != self.card.uid || cascade_levels != self.card.cascade_levels {
            return false;
        }

        match self.state {
            TagState::Idle | TagState::Halted => {
                self.state = TagState::Active;
                true
            }
            _ => {
                // a busy tag drops back to idle on the wakeup
                self.state = TagState::Idle;
                false
            }
        }
    }

    fn transmit(&mut self, frame: &Frame, at: Option<u32>) -> u32 {
        let start = match at {
            // the reader clock wraps, a schedule in the past starts now
            Some(at) if at.wrapping_sub(self.now) < u32::MAX / 2 => at,
            _ => self.now,
        };
        trace!(
            "[SimulationCard::transmit] {} at {}",
            bytes_to_string(&frame.data),
            start
        );

        self.now = start.wrapping_add(frame.duration());
        self.answer = self.process(frame, start);
        start
    }

    fn receive(&mut self, timeout: u32) -> NfcResult<Frame> {
        match self.answer.take() {
            Some(frame) => {
                self.now = self.now.wrapping_add(FRAME_DELAY_TIME + frame.duration());
                trace!("[SimulationCard::receive] {}", bytes_to_string(&frame.data));
                Ok(frame)
            }
            None => {
                self.now = self.now.wrapping_add(timeout);
                Err(NfcError::Timeout)
            }
        }
    }

    fn force_timeout(&mut self) {
        self.transmit(&Frame::new(vec![0x00]), None);
        self.answer = None;
        self.now = self.now.wrapping_add(AUTHENTICATION_TIMEOUT);
    }

    fn ticks(&self) -> u32 {
        self.now
    }

    fn delay(&mut self, ticks: u32) {
        self.now = self.now.wrapping_add(ticks);
    }

    fn field_off(&mut self) {
        self.now = self.now.wrapping_add(1000);
        self.answer = None;
        if self.present {
            self.insert();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card() -> SimulationCard {
        SimulationCard::new(&hex!("9C 59 9B 32"), 16, 7)
            .unwrap()
            .with_sector_keys(1, Key::from_u64(0xA0A1A2A3A4A5), Key::from_u64(0xB0B1B2B3B4B5))
    }

    #[test]
    fn layout() {
        let card = card();
        assert_eq!(card.key(0, KeyType::A), Some(Key::DEFAULT));
        assert_eq!(card.key(1, KeyType::B), Some(Key::from_u64(0xB0B1B2B3B4B5)));
        assert_eq!(card.key(16, KeyType::A), None);
        assert_eq!(card.block(0).unwrap()[..5], hex!("9C 59 9B 32 6C"));
        assert_eq!(card.block(63).unwrap()[6..10], DEFAULT_ACCESS_BITS);
        assert!(card.block(64).is_none());
    }

    #[test]
    fn plain_nonce_after_select() {
        let mut card = card();
        card.select(Polling::Wupa).unwrap();
        card.transmit(&Frame::with_crc(&[CMD_AUTH_KEY_A, 4]), None);
        let nt = card.receive(FRAME_WAIT_TIME).unwrap();
        assert_eq!(nt.len(), 4);
        assert!(!nt.is_short());

        card.force_timeout();
        assert!(card.fast_reselect(&hex!("9C 59 9B 32"), 1));
    }

    #[test]
    fn unknown_block_is_refused() {
        let mut card = card();
        card.select(Polling::Wupa).unwrap();
        card.transmit(&Frame::with_crc(&[CMD_AUTH_KEY_A, 200]), None);
        assert_eq!(card.receive(FRAME_WAIT_TIME), Ok(Frame::short(NAK, 4)));
    }

    #[test]
    fn reqa_does_not_wake_halted_tag() {
        let mut card = card();
        card.select(Polling::Wupa).unwrap();
        card.transmit(&Frame::with_crc(&CMD_HALT), None);
        assert_eq!(card.receive(FRAME_WAIT_TIME), Err(NfcError::Timeout));
        assert_eq!(card.select(Polling::Reqa), Err(NfcError::SelectFailure));
        assert!(card.select(Polling::Wupa).is_ok());
    }

    #[test]
    fn removed_card() {
        let mut card = card();
        card.remove();
        assert_eq!(card.select(Polling::Wupa), Err(NfcError::SelectFailure));
        assert!(!card.fast_reselect(&hex!("9C 59 9B 32"), 1));
        card.insert();
        assert!(card.select(Polling::Wupa).is_ok());
    }

    #[test]
    fn scheduled_transmit() {
        let mut card = card();
        let now = card.ticks();
        let start = card.transmit(&Frame::new(vec![0x26]), Some(now + 500));
        assert_eq!(start, now + 500);
        assert_eq!(card.ticks(), now + 500 + 9 * TICKS_PER_BIT);

        // a past tick sends immediately
        let start = card.transmit(&Frame::new(vec![0x26]), Some(0));
        assert_eq!(start, now + 500 + 9 * TICKS_PER_BIT);
    }

    #[test]
    fn sequential_nonces() {
        let mut card = card().with_nonce_model(NonceModel::Sequential { step: 160 });
        card.select(Polling::Wupa).unwrap();
        card.transmit(&Frame::with_crc(&[CMD_AUTH_KEY_A, 0]), None);
        let first = bytes_to_u32(&card.receive(FRAME_WAIT_TIME).unwrap().data).unwrap();
        card.force_timeout();
        card.fast_reselect(&hex!("9C 59 9B 32"), 1);
        card.transmit(&Frame::with_crc(&[CMD_AUTH_KEY_A, 0]), None);
        let second = bytes_to_u32(&card.receive(FRAME_WAIT_TIME).unwrap().data).unwrap();
        assert_eq!(second, prng_successor(first, 160));
    }

    #[test]
    fn profiles() {
        for profile in ["classic", "static", "hardened", "random", "magic"] {
            assert!(SimulationCard::from_profile(profile, 1).is_ok());
        }
        assert!(SimulationCard::from_profile("desfire", 1).is_err());

        let hardened = SimulationCard::from_profile("hardened", 1).unwrap();
        assert!(hardened.block(128).is_some());
        assert!(hardened.block(143).is_some());
    }
}
