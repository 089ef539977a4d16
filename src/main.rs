use std::path::PathBuf;
use std::process::exit;

use log::{error, info};
use tokio::signal;

use mifare_classic_recovery::application::Application;
use mifare_classic_recovery::env;
use mifare_classic_recovery::nfc_module::device::Device;
use mifare_classic_recovery::nfc_module::nfc::{AbortSignal, EmulatorMemory, SimulationCard};
use mifare_classic_recovery::nfc_module::NfcModule;
use mifare_classic_recovery::websocket_server::WebsocketServer;
use mifare_classic_recovery::ServiceResult;

fn create_device() -> ServiceResult<Device<SimulationCard, EmulatorMemory>> {
    let seed = env::SIMULATION_SEED.parse::<u64>()?;
    let card = SimulationCard::from_profile(&env::SIMULATION_PROFILE, seed)?;
    info!(
        "Simulating a '{}' card with seed {}",
        env::SIMULATION_PROFILE.as_str(),
        seed
    );

    let dictionary = if env::DICTIONARY_FILE.is_empty() {
        None
    } else {
        Some(PathBuf::from(env::DICTIONARY_FILE.as_str()))
    };

    Ok(Device::new(
        card,
        EmulatorMemory::new(),
        dictionary,
        AbortSignal::new(),
    ))
}

#[tokio::main(worker_threads = 4)]
async fn main() {
    dotenv::dotenv().ok();
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "mifare_classic_recovery=info");
    }
    env_logger::init();

    let device = match create_device() {
        Ok(device) => device,
        Err(err) => {
            error!("Unable to create the reader: {}", err);
            exit(1);
        }
    };

    let mut application = Application::new();

    let websocket_server = WebsocketServer::new(
        env::WEBSOCKET_ADDRESS.clone(),
        application.get_request_context(),
        application.get_websocket_receiver(),
    );
    tokio::spawn(async move {
        if let Err(err) = websocket_server.run().await {
            error!("Websocket module stopped: {}", err);
            exit(1);
        }
    });

    let nfc_module = NfcModule::new(
        application.get_response_context(),
        application.get_nfc_receiver(),
        device,
    );
    tokio::spawn(async move {
        if let Err(err) = nfc_module.run().await {
            error!("Nfc module stopped: {}", err);
            exit(1);
        }
    });

    tokio::spawn(application.run());
    match signal::ctrl_c().await {
        Ok(()) => {
            exit(0);
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
            exit(1);
        }
    }
}
