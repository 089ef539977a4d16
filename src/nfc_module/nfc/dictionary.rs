use std::fs;
use std::path::Path;

use log::{info, warn};

use super::mifare_utils::{Key, KEY_LENGTH};
use super::utils::*;

/// Keys that fit the working buffer of one search chunk.
pub const MAX_DICTIONARY_KEYS: usize = 4096;

/// Read a stored dictionary, a plain sequence of 6 byte keys.
pub fn load_dictionary(path: &Path) -> NfcResult<Vec<Key>> {
    let data = fs::read(path).map_err(|e| {
        warn!("Cannot read dictionary {}: {}", path.display(), e);
        NfcError::DictionaryUnavailable
    })?;

    if data.is_empty() || data.len() % KEY_LENGTH != 0 {
        warn!(
            "Dictionary {} is empty or truncated ({} bytes)",
            path.display(),
            data.len()
        );
        return Err(NfcError::DictionaryUnavailable);
    }

    let keys = data
        .chunks_exact(KEY_LENGTH)
        .map(Key::from_slice)
        .collect::<NfcResult<Vec<Key>>>()?;
    info!("Loaded {} keys from {}", keys.len(), path.display());

    Ok(keys)
}

/// Host supplied keys first, then the stored ones, cut to `capacity`.
pub fn merge_keys(host: &[Key], stored: &[Key], capacity: usize) -> Vec<Key> {
    host.iter()
        .chain(stored.iter())
        .take(capacity)
        .copied()
        .collect()
}
