use std::path::Path;

use log::{debug, info, warn};

use super::mifare_classic::{AuthMode, AuthSession};
use super::nfc::dictionary::{load_dictionary, merge_keys, MAX_DICTIONARY_KEYS};
use super::nfc::emulator::BlockStore;
use super::nfc::link_layer::{CardInfo, LinkLayer};
use super::nfc::mifare_utils::*;
use super::nfc::utils::*;

/// Bytes of the found bitmap, two bits per sector.
pub const FOUND_BITMAP_SIZE: usize = MAX_SECTORS * 2 / 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectorKeys {
    pub key_a: Option<Key>,
    pub key_b: Option<Key>,
}

impl SectorKeys {
    fn slot(&self, key_type: KeyType) -> &Option<Key> {
        match key_type.index() {
            0 => &self.key_a,
            _ => &self.key_b,
        }
    }

    fn slot_mut(&mut self, key_type: KeyType) -> &mut Option<Key> {
        match key_type.index() {
            0 => &mut self.key_a,
            _ => &mut self.key_b,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.key_a.is_some() && self.key_b.is_some()
    }
}

/// Recovered keys per sector. A key is only stored after it authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorKeyTable {
    sectors: Vec<SectorKeys>,
}

impl SectorKeyTable {
    pub fn new(sector_count: u8) -> NfcResult<Self> {
        if sector_count == 0 {
            return Err(NfcError::InvalidArgument);
        }
        if sector_count as usize > MAX_SECTORS {
            return Err(NfcError::AllocationFailure);
        }
        Ok(Self {
            sectors: vec![SectorKeys::default(); sector_count as usize],
        })
    }

    pub fn sector_count(&self) -> u8 {
        self.sectors.len() as u8
    }

    pub fn sectors(&self) -> &[SectorKeys] {
        &self.sectors
    }

    pub fn key(&self, sector: u8, key_type: KeyType) -> Option<Key> {
        self.sectors
            .get(sector as usize)
            .and_then(|keys| *keys.slot(key_type))
    }

    pub fn is_found(&self, sector: u8, key_type: KeyType) -> bool {
        self.key(sector, key_type).is_some()
    }

    pub fn is_sector_complete(&self, sector: u8) -> bool {
        self.sectors
            .get(sector as usize)
            .map_or(true, SectorKeys::is_complete)
    }

    /// Store a key, `false` if the slot was already filled.
    pub fn set_key(&mut self, sector: u8, key_type: KeyType, key: Key) -> bool {
        match self.sectors.get_mut(sector as usize) {
            Some(keys) if keys.slot(key_type).is_none() => {
                *keys.slot_mut(key_type) = Some(key);
                true
            }
            _ => false,
        }
    }

    pub fn found_count(&self) -> usize {
        self.sectors
            .iter()
            .map(|k| k.key_a.is_some() as usize + k.key_b.is_some() as usize)
            .sum()
    }

    pub fn all_found(&self) -> bool {
        self.sectors.iter().all(SectorKeys::is_complete)
    }

    /// Bit `2s` marks key A of sector `s`, bit `2s + 1` key B. Bit `n` is
    /// bit `n % 8` of byte `n / 8`.
    pub fn bitmap(&self) -> [u8; FOUND_BITMAP_SIZE] {
        let mut bitmap = [0u8; FOUND_BITMAP_SIZE];
        for (sector, keys) in self.sectors.iter().enumerate() {
            for (offset, found) in [keys.key_a.is_some(), keys.key_b.is_some()]
                .iter()
                .enumerate()
            {
                if *found {
                    let bit = sector * 2 + offset;
                    bitmap[bit / 8] |= 1 << (bit % 8);
                }
            }
        }
        bitmap
    }

    /// Key A and key B of every sector, zero where unknown.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.sectors.len() * KEY_LENGTH * 2);
        for keys in &self.sectors {
            bytes.extend_from_slice(keys.key_a.unwrap_or_default().as_bytes());
            bytes.extend_from_slice(keys.key_b.unwrap_or_default().as_bytes());
        }
        bytes
    }
}

struct ActiveSearch {
    card: CardInfo,
    table: SectorKeyTable,
}

/// State of a key search that spans several host chunks.
#[derive(Default)]
pub struct SearchSession {
    active: Option<ActiveSearch>,
}

impl SearchSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self, card: CardInfo, table: SectorKeyTable) {
        self.active = Some(ActiveSearch { card, table });
    }

    pub fn close(&mut self) {
        self.active = None;
    }

    pub fn is_live(&self) -> bool {
        self.active.is_some()
    }

    pub fn table(&self) -> Option<&SectorKeyTable> {
        self.active.as_ref().map(|active| &active.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Test the keys against one block and key type only.
    SingleSector { block: u8, key_type: KeyType },
    /// All keys against one sector before moving on.
    DepthFirst,
    /// Each key against all sectors before the next key.
    BreadthFirst,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    pub sector_count: u8,
    pub first_chunk: bool,
    pub last_chunk: bool,
    pub strategy: Strategy,
    /// Append the stored dictionary to the host keys.
    pub use_dictionary: bool,
    pub keys: Vec<Key>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkReply {
    /// More chunks are expected.
    Continue { found: usize },
    /// The search is over, the session is closed.
    Complete {
        found: usize,
        table: SectorKeyTable,
        bitmap: [u8; FOUND_BITMAP_SIZE],
        interruption: Option<NfcError>,
    },
    SingleKey(Option<Key>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTestOutcome {
    Success,
    AuthFailure,
    Timeout,
    SelectFailure,
}

/// Reselect the known card and authenticate once.
pub fn test_key<L: LinkLayer>(
    session: &mut AuthSession<L>,
    block: u8,
    key_type: KeyType,
    key: Key,
) -> KeyTestOutcome {
    if session.reselect().is_err() {
        return KeyTestOutcome::SelectFailure;
    }

    match session.authenticate(block, key_type, key, AuthMode::First, None) {
        Ok(_) => KeyTestOutcome::Success,
        Err(NfcError::Timeout) => KeyTestOutcome::Timeout,
        Err(NfcError::SelectFailure) => KeyTestOutcome::SelectFailure,
        Err(_) => KeyTestOutcome::AuthFailure,
    }
}

struct KeySearch<'s, 'a, L: LinkLayer> {
    session: &'s mut AuthSession<'a, L>,
    table: &'s mut SectorKeyTable,
    abort: &'s AbortSignal,
}

impl<'s, 'a, L: LinkLayer> KeySearch<'s, 'a, L> {
    fn try_key(&mut self, block: u8, key_type: KeyType, key: Key) -> NfcResult<bool> {
        match test_key(self.session, block, key_type, key) {
            KeyTestOutcome::Success => Ok(true),
            KeyTestOutcome::SelectFailure => Err(NfcError::SelectFailure),
            KeyTestOutcome::AuthFailure | KeyTestOutcome::Timeout => Ok(false),
        }
    }

    fn found(&mut self, sector: u8, key_type: KeyType, key: Key) {
        if self.table.set_key(sector, key_type, key) {
            debug!("Sector {} key {:?}: {}", sector, key_type, key);
        }
    }

    /// Try a key that just worked on every unresolved slot of its type.
    fn scan(&mut self, key_type: KeyType, key: Key) -> NfcResult<()> {
        for sector in 0..self.table.sector_count() {
            if self.table.is_found(sector, key_type) {
                continue;
            }
            if self.try_key(first_block_of_sector(sector), key_type, key)? {
                self.found(sector, key_type, key);
            }
        }
        Ok(())
    }

    /// Key B from the trailer, if the access conditions let key A read it.
    fn read_key_b(&mut self, sector: u8, key_a: Key) -> NfcResult<Option<Key>> {
        let trailer = trailer_block(sector);
        self.session.reselect()?;

        match self
            .session
            .authenticate(trailer, KeyType::A, key_a, AuthMode::First, None)
        {
            Ok(_) => {}
            Err(NfcError::SelectFailure) => return Err(NfcError::SelectFailure),
            Err(_) => return Ok(None),
        }

        let data = match self.session.read_block(trailer) {
            Ok(data) => data,
            Err(_) => return Ok(None),
        };
        if let Err(e) = self.session.halt() {
            debug!("Halt after trailer read failed: {}", e);
        }

        let key = Key::from_slice(&data[10..16])?;
        Ok(if key.is_zero() { None } else { Some(key) })
    }

    /// Read key B of sectors where only key A is known and reuse it.
    fn read_missing_b(&mut self) -> NfcResult<()> {
        for sector in 0..self.table.sector_count() {
            let key_a = match self.table.key(sector, KeyType::A) {
                Some(key) if !self.table.is_found(sector, KeyType::B) => key,
                _ => continue,
            };

            let key_b = match self.read_key_b(sector, key_a)? {
                Some(key) => key,
                None => continue,
            };
            if self.try_key(first_block_of_sector(sector), KeyType::B, key_b)? {
                debug!("Sector {} key B read from trailer", sector);
                self.found(sector, KeyType::B, key_b);
                self.scan(KeyType::B, key_b)?;
            }
        }
        Ok(())
    }

    fn depth_first(&mut self, keys: &[Key], early_exit: bool) -> NfcResult<()> {
        let found_before = self.table.found_count();

        for sector in 0..self.table.sector_count() {
            if self.table.is_sector_complete(sector) {
                continue;
            }
            let block = first_block_of_sector(sector);

            for key in keys {
                self.abort.check()?;
                if self.table.all_found() {
                    return Ok(());
                }

                if !self.table.is_found(sector, KeyType::A)
                    && self.try_key(block, KeyType::A, *key)?
                {
                    self.found(sector, KeyType::A, *key);
                    self.scan(KeyType::A, *key)?;
                    self.read_missing_b()?;
                    self.scan(KeyType::B, *key)?;
                }

                if !self.table.is_found(sector, KeyType::B)
                    && self.try_key(block, KeyType::B, *key)?
                {
                    self.found(sector, KeyType::B, *key);
                    self.scan(KeyType::B, *key)?;
                }

                if self.table.is_sector_complete(sector) {
                    break;
                }
            }

            if early_exit && self.table.found_count() == found_before {
                debug!("No key of this chunk fits sector {}", sector);
                return Ok(());
            }
        }
        Ok(())
    }

    fn breadth_first(&mut self, keys: &[Key]) -> NfcResult<()> {
        for key in keys {
            self.abort.check()?;

            for sector in 0..self.table.sector_count() {
                if self.table.all_found() {
                    return Ok(());
                }
                if self.table.is_sector_complete(sector) {
                    continue;
                }
                let block = first_block_of_sector(sector);

                if !self.table.is_found(sector, KeyType::A)
                    && self.try_key(block, KeyType::A, *key)?
                {
                    self.found(sector, KeyType::A, *key);
                    self.scan(KeyType::A, *key)?;
                    self.read_missing_b()?;
                }

                if !self.table.is_found(sector, KeyType::B)
                    && self.try_key(block, KeyType::B, *key)?
                {
                    self.found(sector, KeyType::B, *key);
                    self.scan(KeyType::B, *key)?;
                }
            }
        }
        Ok(())
    }

    fn single(&mut self, block: u8, key_type: KeyType, keys: &[Key]) -> NfcResult<Option<Key>> {
        for key in keys {
            self.abort.check()?;
            if self.try_key(block, key_type, *key)? {
                return Ok(Some(*key));
            }
        }
        Ok(None)
    }
}

/// Write the recovered keys into the sector trailers of emulator memory.
fn fill_emulator<S: BlockStore>(memory: &mut S, table: &SectorKeyTable) -> NfcResult<()> {
    for (sector, keys) in table.sectors().iter().enumerate() {
        let block = trailer_block(sector as u8) as usize;
        let mut trailer = memory.get_block(block)?;
        if let Some(key) = keys.key_a {
            trailer[..KEY_LENGTH].copy_from_slice(key.as_bytes());
        }
        if let Some(key) = keys.key_b {
            trailer[10..].copy_from_slice(key.as_bytes());
        }
        memory.set_block(block, &trailer)?;
    }
    Ok(())
}

/// Run one chunk of a key search. The search state survives in `search`
/// between chunks, so a search can be spread over many host requests.
pub fn search_chunk<L: LinkLayer, S: BlockStore>(
    link: &mut L,
    search: &mut SearchSession,
    memory: &mut S,
    dictionary: Option<&Path>,
    request: &ChunkRequest,
    abort: &AbortSignal,
) -> NfcResult<ChunkReply> {
    let keys = if request.use_dictionary {
        let path = dictionary.ok_or(NfcError::DictionaryUnavailable)?;
        merge_keys(&request.keys, &load_dictionary(path)?, MAX_DICTIONARY_KEYS)
    } else {
        request.keys.clone()
    };

    // continuation chunks keep the table of the live search
    if request.first_chunk {
        let table = SectorKeyTable::new(request.sector_count)?;
        let mut session = AuthSession::new(link);
        let card = session.select()?;
        session.force_timeout();
        info!(
            "Key search on {} over {} sectors",
            bytes_to_string(&card.uid),
            request.sector_count
        );
        search.reset(card, table);
    }

    let active = match search.active.as_mut() {
        Some(active) => active,
        None => {
            warn!("Key chunk without a running search");
            return Err(NfcError::InvalidArgument);
        }
    };
    let mut session = AuthSession::resume(link, active.card.clone());
    let mut engine = KeySearch {
        session: &mut session,
        table: &mut active.table,
        abort,
    };

    if let Strategy::SingleSector { block, key_type } = request.strategy {
        let result = engine.single(block, key_type, &keys);
        if !matches!(result, Ok(None)) || request.last_chunk {
            search.close();
        }
        return result.map(ChunkReply::SingleKey);
    }

    let depth = request.strategy == Strategy::DepthFirst || request.use_dictionary;
    let breadth = request.strategy == Strategy::BreadthFirst || request.use_dictionary;

    let mut result = Ok(());
    if depth {
        result = engine.depth_first(&keys, !request.use_dictionary);
    }
    if result.is_ok() && breadth && !engine.table.all_found() {
        result = engine.breadth_first(&keys);
    }

    let interruption = result.err();
    let found = active.table.found_count();
    if !active.table.all_found() && !request.last_chunk && interruption.is_none() {
        debug!("Chunk done, {} keys found so far", found);
        return Ok(ChunkReply::Continue { found });
    }

    if request.use_dictionary && active.table.all_found() {
        fill_emulator(memory, &active.table)?;
    }
    let table = active.table.clone();
    search.close();

    info!(
        "Key search done: {} of {} keys",
        found,
        table.sector_count() as usize * 2
    );
    Ok(ChunkReply::Complete {
        found,
        bitmap: table.bitmap(),
        table,
        interruption,
    })
}

/// Test keys against a single block, returning the first that
/// authenticates.
pub fn check_keys<L: LinkLayer>(
    session: &mut AuthSession<L>,
    block: u8,
    key_type: KeyType,
    keys: &[Key],
    abort: &AbortSignal,
) -> NfcResult<Option<Key>> {
    session.select()?;
    session.force_timeout();

    for key in keys {
        abort.check()?;
        match test_key(session, block, key_type, *key) {
            KeyTestOutcome::Success => {
                if let Err(e) = session.halt() {
                    debug!("Halt after key check failed: {}", e);
                }
                return Ok(Some(*key));
            }
            KeyTestOutcome::SelectFailure => return Err(NfcError::SelectFailure),
            KeyTestOutcome::AuthFailure | KeyTestOutcome::Timeout => {}
        }
    }
    Ok(None)
}
