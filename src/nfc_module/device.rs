use std::path::PathBuf;

use log::{debug, info};

use super::acquisition::*;
use super::calibration::{Calibration, CalibrationConfig};
use super::key_recovery::{check_keys, search_chunk, ChunkReply, ChunkRequest, SearchSession};
use super::mifare_classic::AuthSession;
use super::nfc::emulator::BlockStore;
use super::nfc::link_layer::LinkLayer;
use super::nfc::mifare_utils::{Key, KeyType};
use super::nfc::utils::*;

/// One host request as the engine understands it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRequest {
    AcquireNonces {
        block: u8,
        key_type: KeyType,
    },
    AcquireEncryptedNonces {
        block: u8,
        key_type: KeyType,
        key: Key,
        targets: Vec<NonceTarget>,
        capacity: Option<usize>,
        slow: bool,
    },
    AcquireStaticEncryptedNonces {
        block: u8,
        key_type: KeyType,
        key: Key,
        options: StaticEncryptedOptions,
    },
    Nested {
        request: NestedRequest,
        recalibrate: bool,
    },
    StaticNested(NestedRequest),
    CheckKeys {
        block: u8,
        key_type: KeyType,
        keys: Vec<Key>,
    },
    CheckKeysFast(ChunkRequest),
    HasStaticNonce,
    HasStaticEncryptedNonce(EncryptedNonceCheck),
    ReadSector {
        sector: u8,
        key_type: KeyType,
        key: Key,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceResponse {
    Nonces(Collected<PlainNonces>),
    EncryptedNonces(Collected<EncryptedNonces>),
    StaticEncryptedNonces(Collected<StaticEncryptedNonces>),
    Nested(NestedOutcome),
    KeyCheck(Option<Key>),
    KeySearch(ChunkReply),
    NonceClassification(NonceClassification),
    NonceReport(NonceReport),
    Sector(Vec<u8>),
}

/// The reader with everything that outlives a single request.
pub struct Device<L: LinkLayer, S: BlockStore> {
    link: L,
    memory: S,
    search: SearchSession,
    calibration: Option<Calibration>,
    calibration_config: CalibrationConfig,
    dictionary: Option<PathBuf>,
    abort: AbortSignal,
}

impl<L: LinkLayer, S: BlockStore> Device<L, S> {
    pub fn new(link: L, memory: S, dictionary: Option<PathBuf>, abort: AbortSignal) -> Self {
        Self {
            link,
            memory,
            search: SearchSession::new(),
            calibration: None,
            calibration_config: CalibrationConfig::default(),
            dictionary,
            abort,
        }
    }

    pub fn with_calibration_config(mut self, config: CalibrationConfig) -> Self {
        self.calibration_config = config;
        self
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    pub fn calibration(&self) -> Option<Calibration> {
        self.calibration
    }

    pub fn memory(&self) -> &S {
        &self.memory
    }

    pub fn link(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn is_searching(&self) -> bool {
        self.search.is_live()
    }

    /// Run one request. The abort signal is left as the caller armed it.
    pub fn handle(&mut self, request: DeviceRequest) -> NfcResult<DeviceResponse> {
        debug!("Handle {:?}", request);

        let response = self.dispatch(request);

        // a running key search keeps the tag selected between chunks
        if !self.search.is_live() {
            self.link.field_off();
        }
        if let Err(e) = &response {
            info!("Request failed: {}", e);
        }
        response
    }

    fn dispatch(&mut self, request: DeviceRequest) -> NfcResult<DeviceResponse> {
        let abort = &self.abort;

        if let DeviceRequest::CheckKeysFast(chunk) = &request {
            let reply = search_chunk(
                &mut self.link,
                &mut self.search,
                &mut self.memory,
                self.dictionary.as_deref(),
                chunk,
                abort,
            )?;
            return Ok(DeviceResponse::KeySearch(reply));
        }

        let mut session = AuthSession::new(&mut self.link);
        let response = match request {
            DeviceRequest::AcquireNonces { block, key_type } => {
                DeviceResponse::Nonces(acquire_nonces(&mut session, block, key_type, abort)?)
            }
            DeviceRequest::AcquireEncryptedNonces {
                block,
                key_type,
                key,
                targets,
                capacity,
                slow,
            } => DeviceResponse::EncryptedNonces(acquire_encrypted_nonces(
                &mut session,
                block,
                key_type,
                key,
                &targets,
                capacity.unwrap_or(ENCRYPTED_RECORD_CAPACITY),
                slow,
                abort,
            )?),
            DeviceRequest::AcquireStaticEncryptedNonces {
                block,
                key_type,
                key,
                options,
            } => DeviceResponse::StaticEncryptedNonces(acquire_static_encrypted_nonces(
                &mut session,
                &mut self.memory,
                key,
                block,
                key_type,
                options,
                abort,
            )?),
            DeviceRequest::Nested {
                request,
                recalibrate,
            } => {
                if recalibrate {
                    self.calibration = None;
                }
                DeviceResponse::Nested(acquire_nested(
                    &mut session,
                    &request,
                    &mut self.calibration,
                    &self.calibration_config,
                    abort,
                )?)
            }
            DeviceRequest::StaticNested(request) => DeviceResponse::Nested(NestedOutcome::Nonces(
                acquire_static_nested(&mut session, &request, abort)?,
            )),
            DeviceRequest::CheckKeys {
                block,
                key_type,
                keys,
            } => DeviceResponse::KeyCheck(check_keys(&mut session, block, key_type, &keys, abort)?),
            DeviceRequest::HasStaticNonce => {
                DeviceResponse::NonceClassification(detect_static_nonce(&mut session, abort)?)
            }
            DeviceRequest::HasStaticEncryptedNonce(check) => DeviceResponse::NonceReport(
                check_static_encrypted_nonce(&mut session, &check, abort)?,
            ),
            DeviceRequest::ReadSector {
                sector,
                key_type,
                key,
            } => DeviceResponse::Sector(session.read_sector(sector, key_type, key)?),
            DeviceRequest::CheckKeysFast(_) => return Err(NfcError::InvalidArgument),
        };

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfc_module::key_recovery::Strategy;
    use crate::nfc_module::nfc::emulator::EmulatorMemory;
    use crate::nfc_module::nfc::simulation_card::SimulationCard;

    const KEY_A: Key = Key::new(hex!("A0 A1 A2 A3 A4 A5"));
    const KEY_B: Key = Key::new(hex!("B0 B1 B2 B3 B4 B5"));

    fn device(profile: &str) -> Device<SimulationCard, EmulatorMemory> {
        Device::new(
            SimulationCard::from_profile(profile, 3).unwrap(),
            EmulatorMemory::new(),
            None,
            AbortSignal::new(),
        )
    }

    #[test]
    fn plain_nonces() {
        let mut device = device("classic");
        match device.handle(DeviceRequest::AcquireNonces {
            block: 0,
            key_type: KeyType::A,
        }) {
            Ok(DeviceResponse::Nonces(collected)) => {
                assert!(collected.is_complete());
                assert_eq!(collected.items.nonces.len(), PLAIN_NONCE_CAPACITY);
                assert_eq!(collected.items.cuid, 0x9C599B32);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn nested_reuses_calibration() {
        let mut device = device("classic");
        let request = NestedRequest {
            block: 0,
            key_type: KeyType::A,
            key: Key::DEFAULT,
            target_block: 4,
            target_key_type: KeyType::B,
        };

        let response = device.handle(DeviceRequest::Nested {
            request,
            recalibrate: false,
        });
        assert!(matches!(
            response,
            Ok(DeviceResponse::Nested(NestedOutcome::Nonces(_)))
        ));
        let calibration = device.calibration();
        assert!(calibration.is_some());

        device
            .handle(DeviceRequest::Nested {
                request,
                recalibrate: false,
            })
            .unwrap();
        assert_eq!(device.calibration(), calibration);
    }

    #[test]
    fn read_sector() {
        let mut device = device("classic");
        let data = match device.handle(DeviceRequest::ReadSector {
            sector: 4,
            key_type: KeyType::A,
            key: KEY_A,
        }) {
            Ok(DeviceResponse::Sector(data)) => data,
            other => panic!("unexpected response {:?}", other),
        };

        assert_eq!(data.len(), 64);
        assert_eq!(data[48 + 10..], *KEY_B.as_bytes());

        assert_eq!(
            device.handle(DeviceRequest::ReadSector {
                sector: 4,
                key_type: KeyType::A,
                key: Key::DEFAULT,
            }),
            Err(NfcError::Timeout)
        );
    }

    #[test]
    fn static_nonce_classification() {
        assert_eq!(
            device("static").handle(DeviceRequest::HasStaticNonce),
            Ok(DeviceResponse::NonceClassification(NonceClassification::Static))
        );
        assert_eq!(
            device("classic").handle(DeviceRequest::HasStaticNonce),
            Ok(DeviceResponse::NonceClassification(NonceClassification::Normal))
        );
    }

    #[test]
    fn static_encrypted_nonce_report() {
        let check = EncryptedNonceCheck {
            block: 0,
            key_type: KeyType::A,
            key: Key::DEFAULT,
            nested_block: 0,
            nested_key_type: KeyType::A,
            nested_key: Key::DEFAULT,
            rounds: 2,
            reset: false,
        };

        match device("hardened").handle(DeviceRequest::HasStaticEncryptedNonce(check)) {
            Ok(DeviceResponse::NonceReport(report)) => {
                assert_eq!(report.cuid, 0x9C599B32);
                assert_eq!(report.classification, NonceClassification::StaticEncrypted);
            }
            other => panic!("unexpected response {:?}", other),
        }
        assert!(matches!(
            device("static").handle(DeviceRequest::HasStaticEncryptedNonce(check)),
            Ok(DeviceResponse::NonceReport(NonceReport {
                classification: NonceClassification::SuperStatic,
                ..
            }))
        ));
    }

    #[test]
    fn key_search_spans_requests() {
        let mut device = device("classic");
        let mut chunk = ChunkRequest {
            sector_count: 16,
            first_chunk: true,
            last_chunk: false,
            strategy: Strategy::BreadthFirst,
            use_dictionary: false,
            keys: vec![Key::DEFAULT],
        };

        assert_eq!(
            device.handle(DeviceRequest::CheckKeysFast(chunk.clone())),
            Ok(DeviceResponse::KeySearch(ChunkReply::Continue { found: 8 }))
        );
        assert!(device.is_searching());

        chunk.first_chunk = false;
        chunk.keys = vec![KEY_A];
        match device.handle(DeviceRequest::CheckKeysFast(chunk)) {
            Ok(DeviceResponse::KeySearch(ChunkReply::Complete { found, table, .. })) => {
                assert_eq!(found, 32);
                assert_eq!(table.key(15, KeyType::B), Some(KEY_B));
            }
            other => panic!("unexpected response {:?}", other),
        }
        assert!(!device.is_searching());
    }

    #[test]
    fn dictionary_needs_a_file() {
        let mut device = device("classic");
        let chunk = ChunkRequest {
            sector_count: 16,
            first_chunk: true,
            last_chunk: true,
            strategy: Strategy::DepthFirst,
            use_dictionary: true,
            keys: vec![],
        };
        assert_eq!(
            device.handle(DeviceRequest::CheckKeysFast(chunk)),
            Err(NfcError::DictionaryUnavailable)
        );
    }

    #[test]
    fn armed_abort_cancels_request() {
        let mut device = device("classic");
        let request = DeviceRequest::CheckKeys {
            block: 16,
            key_type: KeyType::A,
            keys: vec![Key::DEFAULT, KEY_A],
        };

        device.abort_signal().set();
        assert_eq!(device.handle(request.clone()), Err(NfcError::Cancelled));
        assert_eq!(device.handle(request.clone()), Err(NfcError::Cancelled));

        device.abort_signal().reset();
        assert_eq!(
            device.handle(request),
            Ok(DeviceResponse::KeyCheck(Some(KEY_A)))
        );
    }
}
