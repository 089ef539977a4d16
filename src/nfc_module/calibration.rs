use log::{debug, info};

use super::mifare_classic::{AuthMode, AuthSession};
use super::nfc::crypto1::prng_successor;
use super::nfc::link_layer::LinkLayer;
use super::nfc::mifare_utils::{Key, KeyType};
use super::nfc::utils::*;

/// Window of PRNG distances a scheduled nested authentication lands in.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Calibration {
    pub min_distance: u32,
    pub max_distance: u32,
    /// Ticks between the first and the nested authentication request.
    pub extra_delay: u32,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CalibrationOutcome {
    Calibrated(Calibration),
    /// The tag answered the same nonce to both authentications too often.
    StaticNonce,
    /// Nonce distances are not reproducible, the PRNG is not predictable.
    NotVulnerable,
}

#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    pub trials: u16,
    /// Trials allowed to miss the search range.
    pub max_failures: u16,
    /// Trials with equal nonces that mark a static nonce tag.
    pub static_limit: u16,
    pub min_search_distance: u32,
    pub max_search_distance: u32,
    /// Added to the measured handshake time so the schedule is reachable.
    pub slack: u32,
    /// Half width of the resulting window around the average distance.
    pub window: u32,
    /// Failed halt/authentication attempts before giving up.
    pub max_retries: u16,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            trials: 17,
            max_failures: 12,
            static_limit: 5,
            min_search_distance: 101,
            max_search_distance: 1199,
            slack: 32,
            window: 2,
            max_retries: 100,
        }
    }
}

struct Trial {
    nt1: u32,
    nt2: u32,
    elapsed: u32,
}

/// Distance from `nt1` to `nt2` within the search range.
fn search_distance(config: &CalibrationConfig, nt1: u32, nt2: u32) -> Option<u32> {
    let mut nt = prng_successor(nt1, config.min_search_distance);
    for distance in config.min_search_distance..=config.max_search_distance {
        if nt == nt2 {
            return Some(distance);
        }
        nt = prng_successor(nt, 1);
    }
    None
}

fn run_trial<L: LinkLayer>(
    session: &mut AuthSession<L>,
    block: u8,
    key_type: KeyType,
    key: Key,
    extra_delay: u32,
) -> NfcResult<Trial> {
    session.halt()?;
    session.select()?;

    let first = session.authenticate(block, key_type, key, AuthMode::First, None)?;
    let at = if extra_delay != 0 {
        Some(first.tick.wrapping_add(extra_delay))
    } else {
        None
    };
    let second = session.authenticate(block, key_type, key, AuthMode::Nested, at)?;

    Ok(Trial {
        nt1: first.nt,
        nt2: second.nt,
        elapsed: second.tick.wrapping_sub(first.tick),
    })
}

/// Measure how far the tag PRNG advances between a first authentication and
/// a nested one scheduled a fixed time later.
///
/// The first converging trial only measures the handshake duration, the
/// following ones are sent at that delay and averaged.
pub fn calibrate<L: LinkLayer>(
    session: &mut AuthSession<L>,
    block: u8,
    key_type: KeyType,
    key: Key,
    config: &CalibrationConfig,
    abort: &AbortSignal,
) -> NfcResult<CalibrationOutcome> {
    let mut extra_delay = 0;
    let mut sum = 0;
    let mut converged = 0;
    let mut min_seen = u32::MAX;
    let mut max_seen = 0;
    let mut failures = 0;
    let mut statics = 0;
    let mut retries = 0;

    let mut trial = 0;
    while trial < config.trials {
        abort.check()?;

        let result = match run_trial(session, block, key_type, key, extra_delay) {
            Ok(result) => result,
            Err(NfcError::SelectFailure) => return Err(NfcError::SelectFailure),
            Err(e) => {
                retries += 1;
                debug!("Calibration trial {} failed: {}", trial, e);
                if retries > config.max_retries {
                    return Err(e);
                }
                continue;
            }
        };

        match search_distance(config, result.nt1, result.nt2) {
            Some(_) if extra_delay == 0 => {
                extra_delay = result.elapsed + config.slack;
                debug!("Calibration delay {} ticks", extra_delay);
            }
            Some(distance) => {
                debug!("Calibration distance {}", distance);
                sum += distance;
                converged += 1;
                min_seen = min_seen.min(distance);
                max_seen = max_seen.max(distance);
            }
            None => {
                failures += 1;
                if failures > config.max_failures {
                    info!("Nonce distances do not converge, tag is not vulnerable");
                    return Ok(CalibrationOutcome::NotVulnerable);
                }
            }
        }

        if result.nt1 == result.nt2 {
            statics += 1;
            if statics >= config.static_limit {
                info!("Static nonce {:08x} detected", result.nt1);
                return Ok(CalibrationOutcome::StaticNonce);
            }
        }

        trial += 1;
    }

    if converged == 0 {
        return Ok(CalibrationOutcome::NotVulnerable);
    }

    let average = (sum + converged / 2) / converged;
    info!(
        "Calibrated: average distance {} (min {}, max {}), delay {}",
        average, min_seen, max_seen, extra_delay
    );

    Ok(CalibrationOutcome::Calibrated(Calibration {
        min_distance: average.saturating_sub(config.window),
        max_distance: average + config.window,
        extra_delay,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfc_module::nfc::simulation_card::{
        NonceModel, SimulationCard, REFERENCE_NONCE, TICKS_PER_PRNG_STEP,
    };

    fn card(seed: u64) -> SimulationCard {
        SimulationCard::new(&hex!("9C 59 9B 32"), 16, seed).unwrap()
    }

    fn run(card: &mut SimulationCard) -> NfcResult<CalibrationOutcome> {
        let mut session = AuthSession::new(card);
        calibrate(
            &mut session,
            0,
            KeyType::A,
            Key::DEFAULT,
            &CalibrationConfig::default(),
            &AbortSignal::new(),
        )
    }

    #[test]
    fn clocked_prng_is_calibrated() {
        for seed in 0..4 {
            let mut card = card(seed);
            let calibration = match run(&mut card) {
                Ok(CalibrationOutcome::Calibrated(calibration)) => calibration,
                other => panic!("unexpected outcome {:?}", other),
            };

            let expected = calibration.extra_delay / TICKS_PER_PRNG_STEP;
            assert_eq!(calibration.max_distance - calibration.min_distance, 4);
            assert!(calibration.min_distance <= expected);
            assert!(expected <= calibration.max_distance);
        }
    }

    #[test]
    fn static_nonce() {
        let mut card =
            card(1).with_nonce_model(NonceModel::Static(prng_successor(REFERENCE_NONCE, 99)));
        assert_eq!(run(&mut card), Ok(CalibrationOutcome::StaticNonce));
    }

    #[test]
    fn random_nonces_are_not_vulnerable() {
        let mut card = card(1).with_nonce_model(NonceModel::Random);
        assert_eq!(run(&mut card), Ok(CalibrationOutcome::NotVulnerable));
    }

    #[test]
    fn removed_tag() {
        let mut card = card(1);
        card.remove();
        assert_eq!(run(&mut card), Err(NfcError::SelectFailure));
    }

    #[test]
    fn cancelled() {
        let mut card = card(1);
        let mut session = AuthSession::new(&mut card);
        let abort = AbortSignal::new();
        abort.set();
        assert_eq!(
            calibrate(
                &mut session,
                0,
                KeyType::A,
                Key::DEFAULT,
                &CalibrationConfig::default(),
                &abort
            ),
            Err(NfcError::Cancelled)
        );
    }

    #[test]
    fn reader_clock_wraps() {
        for offset in (1..12).map(|k| k * 700) {
            let mut card = card(2).with_clock(u32::MAX - offset);
            let calibration = match run(&mut card) {
                Ok(CalibrationOutcome::Calibrated(calibration)) => calibration,
                other => panic!("unexpected outcome {:?} at offset {}", other, offset),
            };

            let expected = calibration.extra_delay / TICKS_PER_PRNG_STEP;
            assert!(calibration.min_distance <= expected);
            assert!(expected <= calibration.max_distance);
        }
    }

    #[test]
    fn search_range() {
        let config = CalibrationConfig::default();
        assert_eq!(
            search_distance(&config, REFERENCE_NONCE, prng_successor(REFERENCE_NONCE, 160)),
            None
        );
        assert_eq!(
            search_distance(&config, REFERENCE_NONCE, prng_successor(REFERENCE_NONCE, 840)),
            Some(840)
        );
    }
}
