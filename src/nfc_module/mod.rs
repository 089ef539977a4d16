use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, info};
use tokio::sync::mpsc;

use crate::{application::ApplicationResponseContext, ServiceResult};

pub mod acquisition;
pub mod calibration;
pub mod device;
pub mod key_recovery;
pub mod mifare_classic;
pub mod nfc;
pub mod nonce_validator;

use device::{Device, DeviceRequest};
use nfc::{AbortSignal, BlockStore, LinkLayer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NfcCommand {
    Request(DeviceRequest),
    /// Stop the running operation, its partial result is still reported.
    Abort,
}

/// Ties the shared abort flag to the order requests were accepted in.
///
/// Each accepted request gets an increasing id. An abort covers the running
/// request and every request accepted before it, even if those are still
/// queued when it arrives.
#[derive(Clone)]
struct AbortScope {
    signal: AbortSignal,
    aborted_through: Arc<AtomicU64>,
}

impl AbortScope {
    fn new(signal: AbortSignal) -> Self {
        Self {
            signal,
            aborted_through: Arc::new(AtomicU64::new(0)),
        }
    }

    fn abort(&self, accepted: u64) {
        self.aborted_through.store(accepted, Ordering::SeqCst);
        self.signal.set();
    }

    /// Arm the flag before the engine handles request `id`.
    fn enter(&self, id: u64) {
        self.signal.reset();
        // an abort racing with the reset above is restored here
        if id <= self.aborted_through.load(Ordering::SeqCst) {
            self.signal.set();
        }
    }
}

pub struct NfcModule<L: LinkLayer, S: BlockStore> {
    context: ApplicationResponseContext,
    recv: mpsc::Receiver<NfcCommand>,
    device: Device<L, S>,
}

impl<L, S> NfcModule<L, S>
where
    L: LinkLayer + Send + 'static,
    S: BlockStore + Send + 'static,
{
    pub fn new(
        context: ApplicationResponseContext,
        recv: mpsc::Receiver<NfcCommand>,
        device: Device<L, S>,
    ) -> Self {
        Self {
            context,
            recv,
            device,
        }
    }

    pub async fn run(self) -> ServiceResult<()> {
        info!("Start nfc module");

        let scope = AbortScope::new(self.device.abort_signal());
        let (request_tx, mut request_rx) = mpsc::channel::<(u64, DeviceRequest)>(4);
        let (response_tx, mut response_rx) = mpsc::channel(4);

        // the reader is driven by one blocking thread only
        let mut device = self.device;
        let engine_scope = scope.clone();
        let engine = tokio::task::spawn_blocking(move || {
            while let Some((id, request)) = request_rx.blocking_recv() {
                engine_scope.enter(id);
                let response = device.handle(request);
                if response_tx.blocking_send(response).is_err() {
                    error!("Nfc response channel closed");
                    break;
                }
            }
        });

        let context = self.context;
        tokio::spawn(async move {
            while let Some(response) = response_rx.recv().await {
                context.send_nfc_response(response).await;
            }
        });

        let mut recv = self.recv;
        let mut accepted = 0;
        let mut pending = VecDeque::new();
        loop {
            tokio::select! {
                command = recv.recv() => match command {
                    Some(NfcCommand::Abort) => {
                        info!("Abort requested");
                        scope.abort(accepted);
                    }
                    Some(NfcCommand::Request(request)) => {
                        accepted += 1;
                        pending.push_back((accepted, request));
                    }
                    None => break,
                },
                permit = request_tx.reserve(), if !pending.is_empty() => {
                    if let Some(request) = pending.pop_front() {
                        permit?.send(request);
                    }
                }
            }
        }

        for request in pending {
            request_tx.send(request).await?;
        }
        drop(request_tx);
        engine.await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfc_module::device::DeviceResponse;
    use crate::nfc_module::nfc::{EmulatorMemory, Key, KeyType, NfcError, SimulationCard};

    fn device() -> Device<SimulationCard, EmulatorMemory> {
        Device::new(
            SimulationCard::from_profile("classic", 3).unwrap(),
            EmulatorMemory::new(),
            None,
            AbortSignal::new(),
        )
    }

    fn check_default_key() -> DeviceRequest {
        DeviceRequest::CheckKeys {
            block: 0,
            key_type: KeyType::A,
            keys: vec![Key::DEFAULT],
        }
    }

    #[test]
    fn abort_cancels_queued_requests() {
        let mut device = device();
        let scope = AbortScope::new(device.abort_signal());

        // two requests are queued before the abort arrives
        scope.abort(2);

        scope.enter(1);
        assert_eq!(device.handle(check_default_key()), Err(NfcError::Cancelled));
        scope.enter(2);
        assert_eq!(device.handle(check_default_key()), Err(NfcError::Cancelled));

        scope.enter(3);
        assert_eq!(
            device.handle(check_default_key()),
            Ok(DeviceResponse::KeyCheck(Some(Key::DEFAULT)))
        );
    }

    #[test]
    fn late_abort_survives_the_reset() {
        let signal = AbortSignal::new();
        let scope = AbortScope::new(signal.clone());

        scope.abort(0);
        scope.enter(1);
        assert!(!signal.is_set());

        scope.abort(1);
        scope.enter(1);
        assert!(signal.is_set());
    }
}
