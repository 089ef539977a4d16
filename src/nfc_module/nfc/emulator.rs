use super::mifare_utils::BLOCK_SIZE;
use super::utils::*;

/// Blocks of the largest emulated card.
pub const CARD_BLOCKS: usize = 256;
/// Scratch blocks for acquired nonce records, placed after the card image.
pub const NONCE_REGION_BLOCK: usize = CARD_BLOCKS;
pub const NONCE_REGION_BLOCKS: usize = 32;

/// Block addressed card emulation memory.
pub trait BlockStore {
    fn get_block(&self, block: usize) -> NfcResult<[u8; BLOCK_SIZE]>;

    fn set_block(&mut self, block: usize, data: &[u8; BLOCK_SIZE]) -> NfcResult<()>;
}

pub struct EmulatorMemory {
    blocks: Vec<[u8; BLOCK_SIZE]>,
}

impl EmulatorMemory {
    pub fn new() -> Self {
        Self {
            blocks: vec![[0u8; BLOCK_SIZE]; CARD_BLOCKS + NONCE_REGION_BLOCKS],
        }
    }

    pub fn clear(&mut self) {
        self.blocks.iter_mut().for_each(|b| *b = [0u8; BLOCK_SIZE]);
    }

    /// Concatenated contents of `count` blocks starting at `first`.
    pub fn dump(&self, first: usize, count: usize) -> NfcResult<Vec<u8>> {
        let blocks = self
            .blocks
            .get(first..first + count)
            .ok_or(NfcError::InvalidArgument)?;
        Ok(blocks.concat())
    }
}

impl Default for EmulatorMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for EmulatorMemory {
    fn get_block(&self, block: usize) -> NfcResult<[u8; BLOCK_SIZE]> {
        self.blocks
            .get(block)
            .copied()
            .ok_or(NfcError::InvalidArgument)
    }

    fn set_block(&mut self, block: usize, data: &[u8; BLOCK_SIZE]) -> NfcResult<()> {
        let slot = self.blocks.get_mut(block).ok_or(NfcError::InvalidArgument)?;
        *slot = *data;
        Ok(())
    }
}
