use serde::{Deserialize, Serialize};

use super::iso14443a::Frame;
use super::utils::*;

/// Command used to wake the tag before anticollision.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Polling {
    /// Wakes only tags in the idle state.
    Reqa,
    /// Wakes idle and halted tags.
    Wupa,
}

/// How a tag is brought into a state that accepts commands.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum WakeupType {
    /// The tag is already selected.
    None,
    Wupa,
    Reqa,
    /// Backdoor wakeup `40`/`43` of gen 1a magic cards.
    Gen1a,
    /// Backdoor wakeup `40` of gen 1b magic cards.
    Gen1b,
    /// Alternative backdoor wakeup `20`/`23` of gdm cards.
    GdmAlt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardInfo {
    pub uid: Vec<u8>,
    /// Last four uid bytes, mixed into every authentication.
    pub cuid: u32,
    pub cascade_levels: u8,
    pub atqa: [u8; 2],
    pub sak: u8,
}

impl CardInfo {
    pub fn new(uid: Vec<u8>, atqa: [u8; 2], sak: u8) -> NfcResult<Self> {
        let cascade_levels = match uid.len() {
            4 => 1,
            7 => 2,
            10 => 3,
            _ => return Err(NfcError::InvalidArgument),
        };
        let cuid = bytes_to_u32(&uid[uid.len() - 4..])?;

        Ok(Self {
            uid,
            cuid,
            cascade_levels,
            atqa,
            sak,
        })
    }
}

/// ISO 14443-A reader front end.
///
/// Times are counted in reader clock ticks. All calls block until the
/// exchange is done.
pub trait LinkLayer {
    /// Full anticollision and select.
    fn select(&mut self, polling: Polling) -> NfcResult<CardInfo>;

    /// Select a known uid without anticollision.
    fn fast_reselect(&mut self, uid: &[u8], cascade_levels: u8) -> bool;

    /// Send a frame, optionally not before tick `at`. Returns the tick the
    /// frame started at.
    fn transmit(&mut self, frame: &Frame, at: Option<u32>) -> u32;

    fn receive(&mut self, timeout: u32) -> NfcResult<Frame>;

    /// Send a malformed one byte frame and wait out the tag's
    /// authentication timeout, so the next select starts from a known
    /// tag state after a fixed delay.
    fn force_timeout(&mut self);

    fn ticks(&self) -> u32;

    fn delay(&mut self, ticks: u32);

    fn field_off(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cascade_levels_from_uid() {
        let card = CardInfo::new(hex!("9C 59 9B 32").to_vec(), hex!("00 04"), 0x08).unwrap();
        assert_eq!(card.cascade_levels, 1);
        assert_eq!(card.cuid, 0x9C599B32);

        let card = CardInfo::new(hex!("04 11 22 33 44 55 66").to_vec(), hex!("00 44"), 0x08).unwrap();
        assert_eq!(card.cascade_levels, 2);
        assert_eq!(card.cuid, 0x33445566);

        assert_eq!(
            CardInfo::new(vec![1, 2, 3], [0, 0], 0),
            Err(NfcError::InvalidArgument)
        );
    }
}
