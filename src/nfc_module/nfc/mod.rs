pub mod crypto1;
pub mod dictionary;
pub mod emulator;
pub mod iso14443a;
pub mod link_layer;
pub mod mifare_utils;
pub mod simulation_card;
pub mod utils;

pub use emulator::{BlockStore, EmulatorMemory};
pub use link_layer::{CardInfo, LinkLayer, Polling, WakeupType};
pub use mifare_utils::{Key, KeyType};
pub use simulation_card::SimulationCard;
pub use utils::{AbortSignal, Collected, NfcError, NfcResult};
