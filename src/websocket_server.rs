use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use base64::engine::general_purpose;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, Mutex},
};
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::{
    application::ApplicationRequestContext,
    nfc_module::{
        acquisition::{NestedNonces, NestedOutcome, NonceClassification, NonceReport},
        device::DeviceResponse,
        key_recovery::ChunkReply,
        nfc::{Collected, Key, KeyType, NfcError, NfcResult},
    },
    ServiceResult,
};

/// Outcome carried by every engine response.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason")]
pub enum StatusDto {
    Success,
    /// The operation stopped early, the payload holds what was gathered.
    Partial(NfcError),
    Fail(NfcError),
}

impl StatusDto {
    fn of(interruption: Option<NfcError>) -> Self {
        match interruption {
            None => StatusDto::Success,
            Some(reason) => StatusDto::Partial(reason),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub struct NonceTargetDto {
    pub block: u8,
    pub key_type: KeyType,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub enum StrategyDto {
    SingleSector { block: u8, key_type: KeyType },
    DepthFirst,
    BreadthFirst,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub enum NonceClassificationDto {
    Normal,
    Static,
    SuperStatic,
    StaticEncrypted,
}

impl From<NonceClassification> for NonceClassificationDto {
    fn from(classification: NonceClassification) -> Self {
        match classification {
            NonceClassification::Normal => NonceClassificationDto::Normal,
            NonceClassification::Static => NonceClassificationDto::Static,
            NonceClassification::SuperStatic => NonceClassificationDto::SuperStatic,
            NonceClassification::StaticEncrypted => NonceClassificationDto::StaticEncrypted,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub struct NestedNoncesDto {
    pub block: u8,
    pub key_type: KeyType,
    pub cuid: u32,
    pub nt_a: u32,
    pub ks_a: u32,
    pub nt_b: u32,
    pub ks_b: u32,
}

impl From<NestedNonces> for NestedNoncesDto {
    fn from(nonces: NestedNonces) -> Self {
        Self {
            block: nonces.block,
            key_type: nonces.key_type,
            cuid: nonces.cuid,
            nt_a: nonces.nt_a,
            ks_a: nonces.ks_a,
            nt_b: nonces.nt_b,
            ks_b: nonces.ks_b,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub enum NestedVulnerabilityDto {
    Vulnerable,
    StaticNonce,
    NotVulnerable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WebsocketResponseMessage {
    Nonces {
        status: StatusDto,
        cuid: u32,
        /// Big endian nonces, base64.
        nonces: String,
    },
    EncryptedNonces {
        status: StatusDto,
        cuid: u32,
        observations: usize,
        /// Packed 9 byte records, base64.
        records: String,
    },
    StaticEncryptedNonces {
        status: StatusDto,
        cuid: u32,
        sectors: u8,
    },
    Nested {
        status: StatusDto,
        vulnerability: NestedVulnerabilityDto,
        nonces: Option<NestedNoncesDto>,
    },
    KeyCheck {
        status: StatusDto,
        key: Option<Key>,
    },
    KeySearch {
        status: StatusDto,
        found: usize,
        complete: bool,
        /// Found flags, bit `2s` key A and bit `2s + 1` key B of sector `s`.
        bitmap: Option<String>,
        /// Key A and key B per sector, zero where unknown.
        keys: Option<String>,
    },
    NonceClassification {
        status: StatusDto,
        static_nonce: bool,
    },
    NonceReport {
        status: StatusDto,
        cuid: u32,
        classification: NonceClassificationDto,
        nt: u32,
        nt_enc: u32,
        parity: u8,
    },
    Sector {
        status: StatusDto,
        data: String,
    },
    Failed {
        status: StatusDto,
    },

    Error {
        source: String,
        message: String,
    },
}

fn encode(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(data)
}

impl From<NfcResult<DeviceResponse>> for WebsocketResponseMessage {
    fn from(result: NfcResult<DeviceResponse>) -> Self {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                return WebsocketResponseMessage::Failed {
                    status: StatusDto::Fail(e),
                }
            }
        };

        match response {
            DeviceResponse::Nonces(Collected {
                items,
                interruption,
            }) => WebsocketResponseMessage::Nonces {
                status: StatusDto::of(interruption),
                cuid: items.cuid,
                nonces: encode(&items.to_bytes()),
            },
            DeviceResponse::EncryptedNonces(Collected {
                items,
                interruption,
            }) => WebsocketResponseMessage::EncryptedNonces {
                status: StatusDto::of(interruption),
                cuid: items.cuid,
                observations: items.observations,
                records: encode(&items.to_bytes()),
            },
            DeviceResponse::StaticEncryptedNonces(Collected {
                items,
                interruption,
            }) => WebsocketResponseMessage::StaticEncryptedNonces {
                status: StatusDto::of(interruption),
                cuid: items.cuid,
                sectors: items.sectors,
            },
            DeviceResponse::Nested(outcome) => {
                let (vulnerability, nonces) = match outcome {
                    NestedOutcome::Nonces(nonces) => {
                        (NestedVulnerabilityDto::Vulnerable, Some(nonces.into()))
                    }
                    NestedOutcome::StaticNonce => (NestedVulnerabilityDto::StaticNonce, None),
                    NestedOutcome::NotVulnerable => (NestedVulnerabilityDto::NotVulnerable, None),
                };
                WebsocketResponseMessage::Nested {
                    status: StatusDto::Success,
                    vulnerability,
                    nonces,
                }
            }
            DeviceResponse::KeyCheck(key) | DeviceResponse::KeySearch(ChunkReply::SingleKey(key)) => {
                WebsocketResponseMessage::KeyCheck {
                    status: StatusDto::Success,
                    key,
                }
            }
            DeviceResponse::KeySearch(ChunkReply::Continue { found }) => {
                WebsocketResponseMessage::KeySearch {
                    status: StatusDto::Success,
                    found,
                    complete: false,
                    bitmap: None,
                    keys: None,
                }
            }
            DeviceResponse::KeySearch(ChunkReply::Complete {
                found,
                table,
                bitmap,
                interruption,
            }) => WebsocketResponseMessage::KeySearch {
                status: StatusDto::of(interruption),
                found,
                complete: true,
                bitmap: Some(encode(&bitmap)),
                keys: Some(encode(&table.to_bytes())),
            },
            DeviceResponse::NonceClassification(classification) => {
                WebsocketResponseMessage::NonceClassification {
                    status: StatusDto::Success,
                    static_nonce: classification != NonceClassification::Normal,
                }
            }
            DeviceResponse::NonceReport(NonceReport {
                cuid,
                classification,
                nt,
                nt_enc,
                parity,
            }) => WebsocketResponseMessage::NonceReport {
                status: StatusDto::Success,
                cuid,
                classification: classification.into(),
                nt,
                nt_enc,
                parity,
            },
            DeviceResponse::Sector(data) => WebsocketResponseMessage::Sector {
                status: StatusDto::Success,
                data: encode(&data),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WebsocketRequestMessage {
    AcquireNonces {
        block: u8,
        key_type: KeyType,
    },
    AcquireEncryptedNonces {
        block: u8,
        key_type: KeyType,
        key: Key,
        targets: Vec<NonceTargetDto>,
        capacity: Option<usize>,
        #[serde(default)]
        slow: bool,
    },
    AcquireStaticEncryptedNonces {
        block: u8,
        key_type: KeyType,
        key: Key,
        #[serde(default)]
        with_data: bool,
        #[serde(default)]
        without_backdoor: bool,
    },
    Nested {
        block: u8,
        key_type: KeyType,
        key: Key,
        target_block: u8,
        target_key_type: KeyType,
        #[serde(default)]
        recalibrate: bool,
    },
    StaticNested {
        block: u8,
        key_type: KeyType,
        key: Key,
        target_block: u8,
        target_key_type: KeyType,
    },
    CheckKeys {
        block: u8,
        key_type: KeyType,
        keys: Vec<Key>,
    },
    CheckKeysFast {
        sector_count: u8,
        first_chunk: bool,
        last_chunk: bool,
        strategy: StrategyDto,
        #[serde(default)]
        use_dictionary: bool,
        keys: Vec<Key>,
    },
    HasStaticNonce,
    HasStaticEncryptedNonce {
        block: u8,
        key_type: KeyType,
        key: Key,
        nested_block: u8,
        nested_key_type: KeyType,
        nested_key: Key,
        rounds: u8,
        #[serde(default)]
        reset: bool,
    },
    ReadSector {
        sector: u8,
        key_type: KeyType,
        key: Key,
    },
    Abort,
}

type PeerMap = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<WebsocketResponseMessage>>>>;

pub struct WebsocketServer {
    address: String,
    context: ApplicationRequestContext,
    recv: mpsc::Receiver<WebsocketResponseMessage>,
    map: PeerMap,
}

impl WebsocketServer {
    pub fn new(
        address: String,
        context: ApplicationRequestContext,
        recv: mpsc::Receiver<WebsocketResponseMessage>,
    ) -> Self {
        Self {
            address,
            context,
            recv,
            map: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn run(self) -> ServiceResult<()> {
        info!("Start websocket module on {}", self.address);

        let listener = TcpListener::bind(&self.address).await?;

        let mut rx = self.recv;
        let map = self.map.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                for sender in map.lock().await.values() {
                    if let Err(e) = sender.send(msg.clone()).await {
                        error!("Cannot send websocket message: {}", e);
                    }
                }
            }
        });

        while let Ok((stream, _)) = listener.accept().await {
            let context = self.context.clone();
            let peer = stream.peer_addr()?;
            let map = self.map.clone();

            tokio::spawn(accept_connection(map, context, peer, stream));
        }

        Ok(())
    }
}

async fn accept_connection(
    peer_map: PeerMap,
    context: ApplicationRequestContext,
    peer: SocketAddr,
    stream: TcpStream,
) {
    if let Err(e) = handle_connection(&peer_map, &context, peer, stream).await {
        error!("Error processing connection: {}", e);
        context.error("WebSocket", &format!("{e}")).await;
    }

    peer_map.lock().await.remove(&peer);
}

async fn handle_connection(
    peer_map: &PeerMap,
    context: &ApplicationRequestContext,
    peer: SocketAddr,
    stream: TcpStream,
) -> ServiceResult<()> {
    let ws_stream = accept_async(stream).await?;

    let (tx, mut rx) = mpsc::channel(16);
    peer_map.lock().await.insert(peer, tx);

    info!("New WebSocket connection: {}", peer);

    let (mut sink, mut stream) = ws_stream.split();

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(msg) = serde_json::to_string(&msg) {
                if let Err(e) = sink.send(Message::Text(msg)).await {
                    error!("Cannot send websocket message: {}", e);
                }
            }
        }
    });

    while let Some(msg) = stream.next().await {
        let msg_data = msg?.into_data();

        if msg_data.is_empty() {
            continue;
        }

        let request = serde_json::from_slice::<WebsocketRequestMessage>(&msg_data);
        match request {
            Ok(request) => context.send_websocket_request(request).await,
            Err(e) => {
                error!("{}", e);
                context
                    .error("WebSocket", "Could not parse WebSocket message!")
                    .await;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::nfc_module::acquisition::PlainNonces;
    use crate::nfc_module::key_recovery::SectorKeyTable;

    #[test]
    fn request_shape() {
        let request: WebsocketRequestMessage = serde_json::from_value(json!({
            "type": "CheckKeysFast",
            "payload": {
                "sector_count": 16,
                "first_chunk": true,
                "last_chunk": false,
                "strategy": { "SingleSector": { "block": 4, "key_type": "B" } },
                "keys": ["FFFFFFFFFFFF", "a0a1a2a3a4a5"]
            }
        }))
        .unwrap();

        assert_eq!(
            request,
            WebsocketRequestMessage::CheckKeysFast {
                sector_count: 16,
                first_chunk: true,
                last_chunk: false,
                strategy: StrategyDto::SingleSector {
                    block: 4,
                    key_type: KeyType::B
                },
                use_dictionary: false,
                keys: vec![Key::DEFAULT, Key::new(hex!("A0 A1 A2 A3 A4 A5"))],
            }
        );

        let abort: WebsocketRequestMessage =
            serde_json::from_value(json!({ "type": "Abort" })).unwrap();
        assert_eq!(abort, WebsocketRequestMessage::Abort);
    }

    #[test]
    fn partial_nonces() {
        let response = WebsocketResponseMessage::from(Ok(DeviceResponse::Nonces(
            Collected::interrupted(
                PlainNonces {
                    cuid: 0x9C599B32,
                    nonces: vec![0x82A4166C],
                },
                NfcError::SelectFailure,
            ),
        )));

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "type": "Nonces",
                "payload": {
                    "status": { "status": "Partial", "reason": "SelectFailure" },
                    "cuid": 0x9C599B32u32,
                    "nonces": "gqQWbA=="
                }
            })
        );
    }

    #[test]
    fn completed_search() {
        let mut table = SectorKeyTable::new(1).unwrap();
        table.set_key(0, KeyType::A, Key::DEFAULT);
        let response = WebsocketResponseMessage::from(Ok(DeviceResponse::KeySearch(
            ChunkReply::Complete {
                found: 1,
                bitmap: table.bitmap(),
                table,
                interruption: None,
            },
        )));

        match response {
            WebsocketResponseMessage::KeySearch {
                status,
                found,
                complete,
                keys,
                ..
            } => {
                assert_eq!(status, StatusDto::Success);
                assert_eq!(found, 1);
                assert!(complete);
                assert_eq!(keys.as_deref(), Some("////////AAAAAAAA"));
            }
            other => panic!("unexpected response {:?}", other),
        }

        assert_eq!(
            serde_json::to_value(WebsocketResponseMessage::from(Err(NfcError::SelectFailure)))
                .unwrap(),
            json!({
                "type": "Failed",
                "payload": { "status": { "status": "Fail", "reason": "SelectFailure" } }
            })
        );
    }

    #[test]
    fn nonce_report() {
        let request: WebsocketRequestMessage = serde_json::from_value(json!({
            "type": "HasStaticEncryptedNonce",
            "payload": {
                "block": 0,
                "key_type": "A",
                "key": "FFFFFFFFFFFF",
                "nested_block": 4,
                "nested_key_type": "B",
                "nested_key": "FFFFFFFFFFFF",
                "rounds": 2
            }
        }))
        .unwrap();
        assert!(matches!(
            request,
            WebsocketRequestMessage::HasStaticEncryptedNonce {
                nested_block: 4,
                rounds: 2,
                reset: false,
                ..
            }
        ));

        let response = WebsocketResponseMessage::from(Ok(DeviceResponse::NonceReport(NonceReport {
            cuid: 0x9C599B32,
            classification: NonceClassification::StaticEncrypted,
            nt: 0x01200145,
            nt_enc: 0x4D3C2B1A,
            parity: 0xA0,
        })));
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "type": "NonceReport",
                "payload": {
                    "status": { "status": "Success" },
                    "cuid": 0x9C599B32u32,
                    "classification": "StaticEncrypted",
                    "nt": 0x01200145,
                    "nt_enc": 0x4D3C2B1A,
                    "parity": 0xA0
                }
            })
        );
    }
}
