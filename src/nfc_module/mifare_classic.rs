use std::convert::TryInto;

use log::{debug, info, trace};

use super::nfc::crypto1::{odd_parity8, prng_successor, Crypto1};
use super::nfc::iso14443a::*;
use super::nfc::link_layer::{CardInfo, LinkLayer, Polling, WakeupType};
use super::nfc::mifare_utils::*;
use super::nfc::utils::*;

/// Fast reselect attempts before the tag is considered gone.
pub const MAX_RESELECT_ATTEMPTS: u8 = 5;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AuthMode {
    /// Plain request on a freshly selected tag.
    First,
    /// Encrypted request inside a running authenticated session.
    Nested,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SessionState {
    Idle,
    Selected,
    FirstAuthDone,
    NestedAuthDone,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct AuthResult {
    pub nt: u32,
    /// Nonce as received, masked in nested mode.
    pub nt_enc: u32,
    /// Wire parity of the received nonce, byte 0 in bit 7.
    pub parity: u8,
    /// Tick the authentication request was sent at.
    pub tick: u32,
}

/// Three pass authentication over a link layer.
///
/// The session keeps the cipher of the last successful authentication. Any
/// failure forces the tag into its authentication timeout and wipes the
/// cipher, after which the tag has to be selected again.
pub struct AuthSession<'a, L: LinkLayer> {
    link: &'a mut L,
    card: Option<CardInfo>,
    cipher: Crypto1,
    state: SessionState,
    magic: bool,
}

impl<'a, L: LinkLayer> AuthSession<'a, L> {
    pub fn new(link: &'a mut L) -> Self {
        Self {
            link,
            card: None,
            cipher: Crypto1::empty(),
            state: SessionState::Idle,
            magic: false,
        }
    }

    /// Continue with a card selected by an earlier session.
    pub fn resume(link: &'a mut L, card: CardInfo) -> Self {
        let mut session = Self::new(link);
        session.card = Some(card);
        session
    }

    pub fn card(&self) -> Option<&CardInfo> {
        self.card.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.state,
            SessionState::FirstAuthDone | SessionState::NestedAuthDone
        )
    }

    pub fn ticks(&self) -> u32 {
        self.link.ticks()
    }

    pub fn delay(&mut self, ticks: u32) {
        self.link.delay(ticks);
    }

    pub fn field_off(&mut self) {
        self.reset();
        self.link.field_off();
    }

    fn cuid(&self) -> NfcResult<u32> {
        self.card
            .as_ref()
            .map(|card| card.cuid)
            .ok_or(NfcError::SelectFailure)
    }

    /// Full anticollision after WUPA.
    pub fn select(&mut self) -> NfcResult<CardInfo> {
        self.select_with(Polling::Wupa)
    }

    fn select_with(&mut self, polling: Polling) -> NfcResult<CardInfo> {
        self.reset();
        let card = self.link.select(polling)?;
        debug!("Select card {}", bytes_to_string(&card.uid));

        self.card = Some(card.clone());
        self.state = SessionState::Selected;
        Ok(card)
    }

    /// Select the known card again without anticollision.
    pub fn reselect(&mut self) -> NfcResult<()> {
        let (uid, cascade_levels) = match self.card.as_ref() {
            Some(card) => (card.uid.clone(), card.cascade_levels),
            None => return Err(NfcError::SelectFailure),
        };
        self.reset();

        for _ in 0..MAX_RESELECT_ATTEMPTS {
            if self.link.fast_reselect(&uid, cascade_levels) {
                self.state = SessionState::Selected;
                return Ok(());
            }
        }

        debug!("Cannot reselect card {}", bytes_to_string(&uid));
        Err(NfcError::SelectFailure)
    }

    pub fn wakeup(&mut self, wakeup: WakeupType) -> NfcResult<()> {
        match wakeup {
            WakeupType::None => Ok(()),
            WakeupType::Wupa => self.select_with(Polling::Wupa).map(|_| ()),
            WakeupType::Reqa => self.select_with(Polling::Reqa).map(|_| ()),
            WakeupType::Gen1a => self.magic_wakeup(MAGIC_WUPC1, Some(MAGIC_WUPC2)),
            WakeupType::Gen1b => self.magic_wakeup(MAGIC_WUPC1, None),
            WakeupType::GdmAlt => self.magic_wakeup(MAGIC_GDM_WUPC1, Some(MAGIC_GDM_WUPC2)),
        }
    }

    fn magic_wakeup(&mut self, first: u8, second: Option<u8>) -> NfcResult<()> {
        self.reset();

        self.link.transmit(&Frame::short(first, 7), None);
        match self.link.receive(FRAME_WAIT_TIME) {
            Ok(answer) if answer.is_ack() => {}
            _ => {
                debug!("Magic wakeup {:02X} not acknowledged", first);
                return Err(NfcError::SelectFailure);
            }
        }

        if let Some(second) = second {
            self.link.transmit(&Frame::new(vec![second]), None);
            match self.link.receive(FRAME_WAIT_TIME) {
                Ok(answer) if answer.is_ack() => {}
                _ => info!("Magic wakeup {:02X} not acknowledged, assume gen 1b", second),
            }
        }

        self.magic = true;
        self.state = SessionState::Selected;
        Ok(())
    }

    pub fn authenticate(
        &mut self,
        block: u8,
        key_type: KeyType,
        key: Key,
        mode: AuthMode,
        at: Option<u32>,
    ) -> NfcResult<AuthResult> {
        let cuid = self.cuid()?;
        self.check_mode(mode)?;

        let tick = self.send_command(&[key_type.command(), block], at);
        let answer = self.expect_answer()?;
        if answer.is_short() || answer.len() != 4 {
            return Err(self.fail(NfcError::AuthFailure));
        }
        let received = bytes_to_u32(&answer.data)?;
        let parity = answer.parity_byte();

        self.cipher = Crypto1::new(key.to_u64());
        let nt = match mode {
            AuthMode::Nested => self.cipher.word(received ^ cuid, true) ^ received,
            AuthMode::First => {
                self.cipher.word(cuid ^ received, false);
                received
            }
        };

        let nr = reader_nonce();
        let mut handshake = Vec::with_capacity(8);
        let mut handshake_parity = Vec::with_capacity(8);
        for b in nr.to_be_bytes() {
            handshake.push(self.cipher.byte(b, false) ^ b);
            handshake_parity.push((self.cipher.peek_filter() ^ odd_parity8(b)) != 0);
        }
        let mut ar = prng_successor(nt, 64).to_be_bytes().to_vec();
        handshake_parity.extend(self.cipher.encrypt_frame(&mut ar));
        handshake.extend(ar);
        self.link
            .transmit(&Frame::encrypted(handshake, handshake_parity), None);

        let answer = self.expect_answer()?;
        if answer.is_short() || answer.len() != 4 {
            return Err(self.fail(NfcError::AuthFailure));
        }
        let tag_answer = bytes_to_u32(&answer.data)? ^ self.cipher.word(0, false);
        if tag_answer != prng_successor(nt, 96) {
            return Err(self.fail(NfcError::AuthFailure));
        }

        trace!(
            "Authenticated block {} with {:?} ({:?}), nt={:08x}",
            block,
            key_type,
            mode,
            nt
        );
        self.state = match mode {
            AuthMode::First => SessionState::FirstAuthDone,
            AuthMode::Nested => SessionState::NestedAuthDone,
        };

        Ok(AuthResult {
            nt,
            nt_enc: received,
            parity,
            tick,
        })
    }

    /// Send a plain authentication request and keep only the tag nonce. The
    /// handshake is abandoned with a forced timeout.
    pub fn request_nonce(&mut self, block: u8, key_type: KeyType) -> NfcResult<AuthResult> {
        self.check_mode(AuthMode::First)?;

        let tick = self.send_command(&[key_type.command(), block], None);
        let answer = self.expect_answer()?;
        if answer.is_short() || answer.len() != 4 {
            return Err(self.fail(NfcError::AuthFailure));
        }
        let nt = bytes_to_u32(&answer.data)?;
        self.force_timeout();

        Ok(AuthResult {
            nt,
            nt_enc: nt,
            parity: answer.parity_byte(),
            tick,
        })
    }

    /// Send an encrypted authentication request inside the running session
    /// and return the masked nonce with its wire parity. The handshake is
    /// abandoned with a forced timeout.
    pub fn request_nested_nonce(
        &mut self,
        block: u8,
        key_type: KeyType,
        at: Option<u32>,
    ) -> NfcResult<AuthResult> {
        self.check_mode(AuthMode::Nested)?;

        let tick = self.send_command(&[key_type.command(), block], at);
        let answer = self.expect_answer()?;
        if answer.is_short() || answer.len() != 4 {
            return Err(self.fail(NfcError::AuthFailure));
        }
        let nt_enc = bytes_to_u32(&answer.data)?;
        self.force_timeout();

        Ok(AuthResult {
            nt: 0,
            nt_enc,
            parity: answer.parity_byte(),
            tick,
        })
    }

    /// Read one block, encrypted inside an authenticated session or plain
    /// after a magic wakeup.
    pub fn read_block(&mut self, block: u8) -> NfcResult<[u8; BLOCK_SIZE]> {
        if !self.is_authenticated() && !self.magic {
            return Err(NfcError::InvalidArgument);
        }

        self.send_command(&[CMD_READ_BLOCK, block], None);
        let mut answer = self.expect_answer()?;
        if answer.is_short() || answer.len() != BLOCK_SIZE + 2 {
            return Err(self.fail(NfcError::CommunicationError));
        }
        if self.is_authenticated() {
            self.cipher.decrypt_frame(&mut answer.data);
        }
        if !check_crc(&answer.data) {
            return Err(self.fail(NfcError::IntegrityError));
        }

        answer.data[..BLOCK_SIZE]
            .try_into()
            .map_err(|_| NfcError::ByteParseError)
    }

    /// Halt the tag. The tag must not answer.
    pub fn halt(&mut self) -> NfcResult<()> {
        self.send_command(&CMD_HALT, None);
        let result = match self.link.receive(FRAME_WAIT_TIME) {
            Err(NfcError::Timeout) => Ok(()),
            Ok(_) => Err(NfcError::CommunicationError),
            Err(e) => Err(e),
        };
        self.reset();
        result
    }

    pub fn force_timeout(&mut self) {
        self.link.force_timeout();
        self.reset();
    }

    /// Wake the tag, optionally authenticate at `first_block` and read
    /// `count` consecutive blocks, then halt.
    pub fn read_blocks(
        &mut self,
        wakeup: WakeupType,
        auth: Option<(KeyType, Key)>,
        first_block: u8,
        count: u8,
    ) -> NfcResult<Vec<u8>> {
        self.wakeup(wakeup)?;
        if let Some((key_type, key)) = auth {
            self.authenticate(first_block, key_type, key, AuthMode::First, None)?;
        }

        let mut data = Vec::with_capacity(count as usize * BLOCK_SIZE);
        for offset in 0..count {
            data.extend_from_slice(&self.read_block(first_block + offset)?);
        }

        self.halt()?;
        Ok(data)
    }

    pub fn read_sector(&mut self, sector: u8, key_type: KeyType, key: Key) -> NfcResult<Vec<u8>> {
        self.read_blocks(
            WakeupType::Wupa,
            Some((key_type, key)),
            first_block_of_sector(sector),
            blocks_in_sector(sector),
        )
    }

    fn check_mode(&self, mode: AuthMode) -> NfcResult<()> {
        let valid = match mode {
            AuthMode::First => self.state == SessionState::Selected,
            AuthMode::Nested => self.is_authenticated(),
        };
        if valid {
            Ok(())
        } else {
            Err(NfcError::InvalidArgument)
        }
    }

    /// Send a command with CRC, encrypted when a session is running.
    fn send_command(&mut self, payload: &[u8], at: Option<u32>) -> u32 {
        let mut data = payload.to_vec();
        append_crc(&mut data);

        let frame = if self.is_authenticated() {
            let parity = self.cipher.encrypt_frame(&mut data);
            Frame::encrypted(data, parity)
        } else {
            Frame::new(data)
        };
        self.link.transmit(&frame, at)
    }

    fn expect_answer(&mut self) -> NfcResult<Frame> {
        match self.link.receive(FRAME_WAIT_TIME) {
            Ok(frame) => Ok(frame),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, error: NfcError) -> NfcError {
        trace!("Exchange failed: {}", error);
        self.force_timeout();
        error
    }

    fn reset(&mut self) {
        self.cipher.wipe();
        self.state = SessionState::Idle;
        self.magic = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfc_module::nfc::crypto1::decrypt_nonce;
    use crate::nfc_module::nfc::simulation_card::{MagicWakeup, NonceModel, SimulationCard};

    const KEY_A: Key = Key::new(hex!("A0 A1 A2 A3 A4 A5"));
    const KEY_B: Key = Key::new(hex!("B0 B1 B2 B3 B4 B5"));

    fn card() -> SimulationCard {
        SimulationCard::new(&hex!("9C 59 9B 32"), 16, 3)
            .unwrap()
            .with_sector_keys(1, KEY_A, KEY_B)
            .with_block(4, hex!("01 02 03 04 05 06 07 08 09 0A 0B 0C 0D 0E 0F 10"))
    }

    #[test]
    fn first_authentication() {
        let mut card = card();
        let mut session = AuthSession::new(&mut card);
        session.select().unwrap();

        let result = session
            .authenticate(4, KeyType::A, KEY_A, AuthMode::First, None)
            .unwrap();
        assert_eq!(result.nt, result.nt_enc);
        assert_eq!(session.state(), SessionState::FirstAuthDone);
    }

    #[test]
    fn wrong_key_times_out() {
        let mut card = card();
        let mut session = AuthSession::new(&mut card);
        session.select().unwrap();

        let result = session.authenticate(4, KeyType::A, Key::DEFAULT, AuthMode::First, None);
        assert_eq!(result, Err(NfcError::Timeout));
        assert_eq!(session.state(), SessionState::Idle);

        // the forced timeout leaves the tag ready for a fast reselect
        session.reselect().unwrap();
        assert!(session
            .authenticate(4, KeyType::A, KEY_A, AuthMode::First, None)
            .is_ok());
    }

    #[test]
    fn unknown_block_fails() {
        let mut card = card();
        let mut session = AuthSession::new(&mut card);
        session.select().unwrap();
        assert_eq!(
            session.authenticate(200, KeyType::A, KEY_A, AuthMode::First, None),
            Err(NfcError::AuthFailure)
        );
    }

    #[test]
    fn nested_authentication() {
        let mut card = card().with_nonce_model(NonceModel::Sequential { step: 160 });
        let mut session = AuthSession::new(&mut card);
        session.select().unwrap();

        let first = session
            .authenticate(0, KeyType::A, Key::DEFAULT, AuthMode::First, None)
            .unwrap();
        let nested = session
            .authenticate(4, KeyType::B, KEY_B, AuthMode::Nested, None)
            .unwrap();

        assert_eq!(nested.nt, prng_successor(first.nt, 160));
        assert_ne!(nested.nt, nested.nt_enc);
        assert_eq!(session.state(), SessionState::NestedAuthDone);

        assert!(session
            .authenticate(0, KeyType::A, Key::DEFAULT, AuthMode::Nested, None)
            .is_ok());
    }

    #[test]
    fn nested_needs_running_session() {
        let mut card = card();
        let mut session = AuthSession::new(&mut card);
        assert_eq!(
            session.authenticate(0, KeyType::A, Key::DEFAULT, AuthMode::First, None),
            Err(NfcError::SelectFailure)
        );

        session.select().unwrap();
        assert_eq!(
            session.authenticate(0, KeyType::A, Key::DEFAULT, AuthMode::Nested, None),
            Err(NfcError::InvalidArgument)
        );
    }

    #[test]
    fn masked_nested_nonce() {
        let mut card = card().with_nonce_model(NonceModel::Sequential { step: 200 });
        let cuid = card.card_info().cuid;
        let mut session = AuthSession::new(&mut card);
        session.select().unwrap();

        let first = session
            .authenticate(0, KeyType::A, Key::DEFAULT, AuthMode::First, None)
            .unwrap();
        let masked = session.request_nested_nonce(4, KeyType::A, None).unwrap();

        assert_eq!(
            decrypt_nonce(KEY_A.to_u64(), cuid, masked.nt_enc),
            prng_successor(first.nt, 200)
        );
        assert_eq!(session.state(), SessionState::Idle);
        session.reselect().unwrap();
    }

    #[test]
    fn plain_nonce() {
        let mut card = card().with_nonce_model(NonceModel::Static(0x01200145));
        let mut session = AuthSession::new(&mut card);
        session.select().unwrap();

        let result = session.request_nonce(0, KeyType::A).unwrap();
        assert_eq!(result.nt, 0x01200145);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn read_sector() {
        let mut card = card().with_readable_key_b(true);
        let mut session = AuthSession::new(&mut card);

        let data = session.read_sector(1, KeyType::A, KEY_A).unwrap();
        assert_eq!(data.len(), 64);
        assert_eq!(data[..16], hex!("01 02 03 04 05 06 07 08 09 0A 0B 0C 0D 0E 0F 10"));
        // key A is never readable
        assert_eq!(data[48..54], [0u8; 6]);
        assert_eq!(data[58..64], *KEY_B.as_bytes());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn read_needs_authentication() {
        let mut card = card();
        let mut session = AuthSession::new(&mut card);
        session.select().unwrap();
        assert_eq!(session.read_block(4), Err(NfcError::InvalidArgument));
    }

    #[test]
    fn magic_wakeup_reads_plain() {
        let mut magic = card().with_magic_wakeup(MagicWakeup::Gen1);
        let mut session = AuthSession::new(&mut magic);

        let data = session
            .read_blocks(WakeupType::Gen1a, None, 4, 4)
            .unwrap();
        assert_eq!(data[48..54], *KEY_A.as_bytes());

        let mut plain = card();
        let mut session = AuthSession::new(&mut plain);
        assert_eq!(
            session.wakeup(WakeupType::Gen1a),
            Err(NfcError::SelectFailure)
        );
    }

    #[test]
    fn gdm_wakeup() {
        let mut card = card().with_magic_wakeup(MagicWakeup::Gdm);
        let mut session = AuthSession::new(&mut card);
        assert!(session.wakeup(WakeupType::GdmAlt).is_ok());
        assert_eq!(session.state(), SessionState::Selected);
        assert_eq!(session.read_block(0).unwrap()[..4], hex!("9C 59 9B 32"));
    }

    #[test]
    fn halt_then_select() {
        let mut card = card();
        let mut session = AuthSession::new(&mut card);
        session.select().unwrap();
        session
            .authenticate(0, KeyType::A, Key::DEFAULT, AuthMode::First, None)
            .unwrap();
        session.halt().unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.wakeup(WakeupType::Reqa), Err(NfcError::SelectFailure));
        assert!(session.wakeup(WakeupType::Wupa).is_ok());
    }
}
