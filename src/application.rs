use std::process::exit;

use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::{
    nfc_module::{
        acquisition::{EncryptedNonceCheck, NestedRequest, NonceTarget, StaticEncryptedOptions},
        device::{DeviceRequest, DeviceResponse},
        key_recovery::{ChunkRequest, Strategy},
        nfc::{Key, NfcResult},
        NfcCommand,
    },
    websocket_server::{StrategyDto, WebsocketRequestMessage, WebsocketResponseMessage},
};

enum ApplicationCommand {
    Response(WebsocketResponseMessage),
    Request(WebsocketRequestMessage),
    Error { source: String, message: String },
}

#[derive(Clone)]
pub struct ApplicationResponseContext {
    sender: mpsc::Sender<ApplicationCommand>,
}

impl ApplicationResponseContext {
    pub async fn send_nfc_response(&self, response: NfcResult<DeviceResponse>) {
        if self
            .sender
            .send(ApplicationCommand::Response(response.into()))
            .await
            .is_err()
        {
            error!("Internal message bus seems to be dead. Aborting!");
            exit(1);
        }
    }
}

#[derive(Clone)]
pub struct ApplicationRequestContext {
    sender: mpsc::Sender<ApplicationCommand>,
}

impl ApplicationRequestContext {
    pub async fn send_websocket_request(&self, message: WebsocketRequestMessage) {
        if self
            .sender
            .send(ApplicationCommand::Request(message))
            .await
            .is_err()
        {
            error!("Internal message bus seems to be dead. Aborting!");
            exit(1);
        }
    }

    pub async fn error<S: Into<String>, M: Into<String>>(&self, source: S, message: M) {
        if self
            .sender
            .send(ApplicationCommand::Error {
                source: source.into(),
                message: message.into(),
            })
            .await
            .is_err()
        {
            error!("Internal message bus seems to be dead. Aborting!");
            exit(1);
        }
    }
}

pub struct Application {
    command_sender: mpsc::Sender<ApplicationCommand>,
    command_recv: mpsc::Receiver<ApplicationCommand>,
    websocket_sender: Option<mpsc::Sender<WebsocketResponseMessage>>,
    nfc_sender: Option<mpsc::Sender<NfcCommand>>,
}

impl Application {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(32);

        Self {
            command_sender: tx,
            command_recv: rx,
            websocket_sender: None,
            nfc_sender: None,
        }
    }

    pub fn get_request_context(&self) -> ApplicationRequestContext {
        ApplicationRequestContext {
            sender: self.command_sender.clone(),
        }
    }

    pub fn get_response_context(&self) -> ApplicationResponseContext {
        ApplicationResponseContext {
            sender: self.command_sender.clone(),
        }
    }

    pub fn get_websocket_receiver(&mut self) -> mpsc::Receiver<WebsocketResponseMessage> {
        let (tx, rx) = mpsc::channel(4);
        self.websocket_sender = Some(tx);
        rx
    }

    pub fn get_nfc_receiver(&mut self) -> mpsc::Receiver<NfcCommand> {
        let (tx, rx) = mpsc::channel(4);
        self.nfc_sender = Some(tx);
        rx
    }

    fn check_keys_given(keys: &[Key]) -> Result<(), (String, String)> {
        if keys.is_empty() {
            return Err((
                "Invalid request".into(),
                "At least one key is required.".into(),
            ));
        }
        Ok(())
    }

    /// Translate a host message into an engine command.
    fn parse_request(request: WebsocketRequestMessage) -> Result<NfcCommand, (String, String)> {
        let request = match request {
            WebsocketRequestMessage::Abort => return Ok(NfcCommand::Abort),
            WebsocketRequestMessage::AcquireNonces { block, key_type } => {
                DeviceRequest::AcquireNonces { block, key_type }
            }
            WebsocketRequestMessage::AcquireEncryptedNonces {
                block,
                key_type,
                key,
                targets,
                capacity,
                slow,
            } => {
                if targets.is_empty() {
                    return Err((
                        "Invalid request".into(),
                        "At least one nonce target is required.".into(),
                    ));
                }
                DeviceRequest::AcquireEncryptedNonces {
                    block,
                    key_type,
                    key,
                    targets: targets
                        .into_iter()
                        .map(|t| NonceTarget {
                            block: t.block,
                            key_type: t.key_type,
                        })
                        .collect(),
                    capacity,
                    slow,
                }
            }
            WebsocketRequestMessage::AcquireStaticEncryptedNonces {
                block,
                key_type,
                key,
                with_data,
                without_backdoor,
            } => DeviceRequest::AcquireStaticEncryptedNonces {
                block,
                key_type,
                key,
                options: StaticEncryptedOptions {
                    with_data,
                    without_backdoor,
                },
            },
            WebsocketRequestMessage::Nested {
                block,
                key_type,
                key,
                target_block,
                target_key_type,
                recalibrate,
            } => DeviceRequest::Nested {
                request: NestedRequest {
                    block,
                    key_type,
                    key,
                    target_block,
                    target_key_type,
                },
                recalibrate,
            },
            WebsocketRequestMessage::StaticNested {
                block,
                key_type,
                key,
                target_block,
                target_key_type,
            } => DeviceRequest::StaticNested(NestedRequest {
                block,
                key_type,
                key,
                target_block,
                target_key_type,
            }),
            WebsocketRequestMessage::CheckKeys {
                block,
                key_type,
                keys,
            } => {
                Self::check_keys_given(&keys)?;
                DeviceRequest::CheckKeys {
                    block,
                    key_type,
                    keys,
                }
            }
            WebsocketRequestMessage::CheckKeysFast {
                sector_count,
                first_chunk,
                last_chunk,
                strategy,
                use_dictionary,
                keys,
            } => {
                if !use_dictionary {
                    Self::check_keys_given(&keys)?;
                }
                let strategy = match strategy {
                    StrategyDto::SingleSector { block, key_type } => {
                        Strategy::SingleSector { block, key_type }
                    }
                    StrategyDto::DepthFirst => Strategy::DepthFirst,
                    StrategyDto::BreadthFirst => Strategy::BreadthFirst,
                };
                DeviceRequest::CheckKeysFast(ChunkRequest {
                    sector_count,
                    first_chunk,
                    last_chunk,
                    strategy,
                    use_dictionary,
                    keys,
                })
            }
            WebsocketRequestMessage::HasStaticNonce => DeviceRequest::HasStaticNonce,
            WebsocketRequestMessage::HasStaticEncryptedNonce {
                block,
                key_type,
                key,
                nested_block,
                nested_key_type,
                nested_key,
                rounds,
                reset,
            } => DeviceRequest::HasStaticEncryptedNonce(EncryptedNonceCheck {
                block,
                key_type,
                key,
                nested_block,
                nested_key_type,
                nested_key,
                rounds,
                reset,
            }),
            WebsocketRequestMessage::ReadSector {
                sector,
                key_type,
                key,
            } => DeviceRequest::ReadSector {
                sector,
                key_type,
                key,
            },
        };

        Ok(NfcCommand::Request(request))
    }

    async fn send_to_websocket(&self, message: WebsocketResponseMessage) {
        if let Some(sender) = self.websocket_sender.as_ref() {
            if sender.send(message).await.is_err() {
                error!("Internal message bus seems to be dead. Aborting!");
                exit(1);
            }
        }
    }

    pub async fn run(mut self) {
        info!("Start application module");

        while let Some(command) = self.command_recv.recv().await {
            match command {
                ApplicationCommand::Request(request) => match Self::parse_request(request) {
                    Ok(nfc_command) => {
                        if let Some(sender) = self.nfc_sender.as_ref() {
                            if sender.send(nfc_command).await.is_err() {
                                error!("Internal message bus seems to be dead. Aborting!");
                                exit(1);
                            }
                        }
                    }
                    Err((source, message)) => {
                        warn!("Error({:?}, {:?})", source, message);
                        self.send_to_websocket(WebsocketResponseMessage::Error { source, message })
                            .await;
                    }
                },
                ApplicationCommand::Response(response) => self.send_to_websocket(response).await,
                ApplicationCommand::Error { source, message } => {
                    warn!("Error({:?}, {:?})", source, message);
                    self.send_to_websocket(WebsocketResponseMessage::Error { source, message })
                        .await;
                }
            }
        }
    }
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfc_module::nfc::KeyType;

    #[test]
    fn abort_bypasses_the_engine_queue() {
        assert_eq!(
            Application::parse_request(WebsocketRequestMessage::Abort),
            Ok(NfcCommand::Abort)
        );
    }

    #[test]
    fn requests_are_translated() {
        assert_eq!(
            Application::parse_request(WebsocketRequestMessage::CheckKeysFast {
                sector_count: 16,
                first_chunk: true,
                last_chunk: true,
                strategy: StrategyDto::DepthFirst,
                use_dictionary: true,
                keys: vec![],
            }),
            Ok(NfcCommand::Request(DeviceRequest::CheckKeysFast(ChunkRequest {
                sector_count: 16,
                first_chunk: true,
                last_chunk: true,
                strategy: Strategy::DepthFirst,
                use_dictionary: true,
                keys: vec![],
            })))
        );

        assert!(Application::parse_request(WebsocketRequestMessage::CheckKeys {
            block: 0,
            key_type: KeyType::A,
            keys: vec![],
        })
        .is_err());

        assert!(matches!(
            Application::parse_request(WebsocketRequestMessage::Nested {
                block: 0,
                key_type: KeyType::A,
                key: Key::DEFAULT,
                target_block: 4,
                target_key_type: KeyType::B,
                recalibrate: true,
            }),
            Ok(NfcCommand::Request(DeviceRequest::Nested {
                recalibrate: true,
                ..
            }))
        ));

        assert!(matches!(
            Application::parse_request(WebsocketRequestMessage::HasStaticEncryptedNonce {
                block: 0,
                key_type: KeyType::A,
                key: Key::DEFAULT,
                nested_block: 4,
                nested_key_type: KeyType::B,
                nested_key: Key::DEFAULT,
                rounds: 3,
                reset: true,
            }),
            Ok(NfcCommand::Request(DeviceRequest::HasStaticEncryptedNonce(
                EncryptedNonceCheck {
                    rounds: 3,
                    reset: true,
                    ..
                }
            )))
        ));
    }
}
