use super::nfc::crypto1::{odd_parity8, prng_successor};

/// Outcome of a nonce search over a window of PRNG distances.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum NonceCandidate {
    Unique { nt: u32, ks: u32, distance: u32 },
    /// No distance in the window matches the parity bits.
    Invalid,
    /// More than one distance matches, the pair has to be acquired again.
    Ambiguous,
}

fn nonce_byte(nt: u32, index: usize) -> u8 {
    (nt >> (24 - 8 * index)) as u8
}

/// Wire parity bits of a masked nonce that differ from the odd parity of
/// the masked bytes.
pub fn parity_errors(nt_enc: u32, parity: u8) -> [bool; 4] {
    let mut errors = [false; 4];
    for (i, error) in errors.iter_mut().enumerate() {
        let wire = (parity >> (7 - i)) & 1;
        *error = odd_parity8(nonce_byte(nt_enc, i)) != wire;
    }
    errors
}

/// The parity errors packed into a nibble, byte 0 in bit 3.
pub fn parity_error_syndrome(nt_enc: u32, parity: u8) -> u8 {
    parity_errors(nt_enc, parity)
        .iter()
        .fold(0, |acc, error| acc << 1 | *error as u8)
}

/// Check a candidate nonce against the parity bits of its masked form. The
/// parity bit after byte `i` is encrypted with the first keystream bit of
/// byte `i + 1`, so the last byte cannot be checked.
pub fn valid_nonce(nt: u32, nt_enc: u32, ks1: u32, par_err: &[bool; 4]) -> bool {
    (0..3).all(|i| {
        let ks_bit = ((ks1 >> (16 - 8 * i)) & 1) as u8;
        odd_parity8(nonce_byte(nt, i))
            == (par_err[i] as u8 ^ odd_parity8(nonce_byte(nt_enc, i)) ^ ks_bit)
    })
}

/// Search the successors of `nt1` at distances `min_distance..=max_distance`
/// for the nonce hidden in `nt_enc`.
pub fn find_nonce(
    nt1: u32,
    nt_enc: u32,
    parity: u8,
    min_distance: u32,
    max_distance: u32,
) -> NonceCandidate {
    if min_distance > max_distance {
        return NonceCandidate::Invalid;
    }

    let par_err = parity_errors(nt_enc, parity);
    let mut candidate = NonceCandidate::Invalid;
    let mut nt = prng_successor(nt1, min_distance);

    for distance in min_distance..=max_distance {
        let ks = nt ^ nt_enc;
        if valid_nonce(nt, nt_enc, ks, &par_err) {
            if candidate != NonceCandidate::Invalid {
                return NonceCandidate::Ambiguous;
            }
            candidate = NonceCandidate::Unique { nt, ks, distance };
        }
        nt = prng_successor(nt, 1);
    }

    candidate
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::nfc_module::nfc::crypto1::Crypto1;

    /// Nonce and wire parity as a tag sends them in a nested authentication.
    fn mask(key: u64, cuid: u32, nt: u32) -> (u32, u8) {
        let mut cipher = Crypto1::new(key);
        let ks = cipher.word(cuid ^ nt, false);
        let mut parity = 0u8;
        for i in 0..4 {
            let ks_bit = if i < 3 {
                ((ks >> (16 - 8 * i)) & 1) as u8
            } else {
                cipher.peek_filter()
            };
            parity |= (odd_parity8(nonce_byte(nt, i)) ^ ks_bit) << (7 - i);
        }
        (nt ^ ks, parity)
    }

    #[test]
    fn syndrome() {
        assert_eq!(parity_error_syndrome(0, 0), 0x0F);
        assert_eq!(parity_error_syndrome(0, 0xF0), 0x00);
        assert_eq!(parity_error_syndrome(0x01000000, 0x00), 0x07);
        assert_eq!(parity_errors(0x01000000, 0x00), [false, true, true, true]);
    }

    #[test]
    fn true_nonce_is_accepted() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..1000 {
            let key = rng.gen::<u64>() & 0xFFFF_FFFF_FFFF;
            let cuid = rng.gen();
            let nt = rng.gen();
            let (nt_enc, parity) = mask(key, cuid, nt);

            let par_err = parity_errors(nt_enc, parity);
            assert!(valid_nonce(nt, nt_enc, nt ^ nt_enc, &par_err));
        }
    }

    #[test]
    fn false_positive_rate() {
        let mut rng = StdRng::seed_from_u64(2);
        let trials = 20000;
        let mut accepted = 0;
        for _ in 0..trials {
            let key = rng.gen::<u64>() & 0xFFFF_FFFF_FFFF;
            let (nt_enc, parity) = mask(key, rng.gen(), rng.gen());
            let guess: u32 = rng.gen();

            let par_err = parity_errors(nt_enc, parity);
            if valid_nonce(guess, nt_enc, guess ^ nt_enc, &par_err) {
                accepted += 1;
            }
        }

        // three checked parity bits
        let rate = accepted as f64 / trials as f64;
        assert!(rate > 0.10 && rate < 0.15, "rate {}", rate);
    }

    #[test]
    fn search_never_guesses() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut unique = 0;
        for _ in 0..200 {
            let nt1 = prng_successor(0x82a4166c, rng.gen_range(0..65535));
            let distance = rng.gen_range(200..800);
            let nt = prng_successor(nt1, distance);
            let (nt_enc, parity) = mask(0xFFFF_FFFF_FFFF, 0x329B599C, nt);

            match find_nonce(nt1, nt_enc, parity, distance - 2, distance + 2) {
                NonceCandidate::Unique {
                    nt: found,
                    ks,
                    distance: found_distance,
                } => {
                    assert_eq!(found, nt);
                    assert_eq!(ks, nt ^ nt_enc);
                    assert_eq!(found_distance, distance);
                    unique += 1;
                }
                NonceCandidate::Ambiguous => {}
                NonceCandidate::Invalid => panic!("true nonce rejected"),
            }

            assert_eq!(
                find_nonce(nt1, nt_enc, parity, distance, distance),
                NonceCandidate::Unique {
                    nt,
                    ks: nt ^ nt_enc,
                    distance
                }
            );
        }
        assert!(unique > 50);
    }

    #[test]
    fn empty_window() {
        assert_eq!(find_nonce(0x82a4166c, 0, 0, 10, 9), NonceCandidate::Invalid);
    }
}
