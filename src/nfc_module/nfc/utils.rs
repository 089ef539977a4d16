use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum NfcError {
    /// Tag absent or removed. Fatal to the running operation.
    SelectFailure,
    /// Wrong key or protocol NAK. Local, the next candidate may be tried.
    AuthFailure,
    /// No answer within the frame waiting time.
    Timeout,
    /// Classification outcome: the tag repeats its nonces.
    StaticNonceDetected,
    /// Aborted by the button or the host.
    Cancelled,
    /// No scratch buffer for the requested nonce or key table.
    AllocationFailure,
    InvalidArgument,
    DictionaryUnavailable,
    CommunicationError,
    ByteParseError,
    IntegrityError,
}

pub type NfcResult<T> = Result<T, NfcError>;

impl std::fmt::Display for NfcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<std::io::Error> for NfcError {
    fn from(_err: std::io::Error) -> Self {
        NfcError::ByteParseError
    }
}

/// Result of a long running operation that may stop early.
///
/// Whatever was gathered before the interruption is kept in `items`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collected<T> {
    pub items: T,
    pub interruption: Option<NfcError>,
}

impl<T> Collected<T> {
    pub fn complete(items: T) -> Self {
        Self {
            items,
            interruption: None,
        }
    }

    pub fn interrupted(items: T, error: NfcError) -> Self {
        Self {
            items,
            interruption: Some(error),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.interruption.is_none()
    }
}

/// Cancellation flag shared between the host channel and the engine thread.
/// Long running operations poll it once per iteration.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the signal is set.
    pub fn check(&self) -> NfcResult<()> {
        if self.is_set() {
            Err(NfcError::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub fn bytes_to_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|x| format!("{:02X}", x))
        .collect::<Vec<String>>()
        .join(" ")
}

pub fn bytes_to_u32(bytes: &[u8]) -> NfcResult<u32> {
    Ok(Cursor::new(bytes).read_u32::<BigEndian>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_strings() {
        assert_eq!(bytes_to_string(&hex!("A0 A1 0F")), "A0 A1 0F");
    }

    #[test]
    fn abort_signal() {
        let signal = AbortSignal::new();
        let shared = signal.clone();
        assert!(signal.check().is_ok());
        shared.set();
        assert_eq!(signal.check(), Err(NfcError::Cancelled));
        signal.reset();
        assert!(!shared.is_set());
    }

    #[test]
    fn big_endian_numbers() {
        assert_eq!(bytes_to_u32(&hex!("82 A4 16 6C")), Ok(0x82A4166C));
        assert_eq!(bytes_to_u32(&hex!("82 A4")), Err(NfcError::ByteParseError));
    }
}
