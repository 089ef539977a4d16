use std::process::exit;

use mifare_classic_recovery::nfc_module::device::{Device, DeviceRequest, DeviceResponse};
use mifare_classic_recovery::nfc_module::key_recovery::{ChunkReply, ChunkRequest, Strategy};
use mifare_classic_recovery::nfc_module::nfc::{
    utils, AbortSignal, EmulatorMemory, Key, KeyType, SimulationCard,
};
use mifare_classic_recovery::websocket_server::WebsocketResponseMessage;

fn print(response: &WebsocketResponseMessage) {
    match serde_json::to_string_pretty(response) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Cannot serialize response: {e}"),
    }
}

/// Drive the engine against a simulated card and print the host messages.
pub fn main() {
    let mut args = std::env::args().skip(1);
    let profile = args.next().unwrap_or_else(|| "classic".to_owned());
    let seed = args.next().and_then(|s| s.parse().ok()).unwrap_or(0);

    let card = match SimulationCard::from_profile(&profile, seed) {
        Ok(card) => card,
        Err(e) => {
            eprintln!("Unknown profile '{profile}': {e}");
            exit(1)
        }
    };
    println!("# Simulated card");
    println!("-- uid: {}", utils::bytes_to_string(&card.card_info().uid));

    let mut device = Device::new(card, EmulatorMemory::new(), None, AbortSignal::new());

    println!();
    println!("# Nonce classification");
    print(&device.handle(DeviceRequest::HasStaticNonce).into());

    println!();
    println!("# Key search");
    let keys = vec![
        Key::DEFAULT,
        Key::new([0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5]),
        Key::new([0xD3, 0xF7, 0xD3, 0xF7, 0xD3, 0xF7]),
    ];
    let chunks = keys.len();
    for (i, key) in keys.into_iter().enumerate() {
        let response = device.handle(DeviceRequest::CheckKeysFast(ChunkRequest {
            sector_count: 16,
            first_chunk: i == 0,
            last_chunk: i + 1 == chunks,
            strategy: Strategy::BreadthFirst,
            use_dictionary: false,
            keys: vec![key],
        }));
        let done = !matches!(
            response,
            Ok(DeviceResponse::KeySearch(ChunkReply::Continue { .. }))
        );
        print(&response.into());
        if done {
            break;
        }
    }

    println!();
    println!("# Plain nonces");
    print(
        &device
            .handle(DeviceRequest::AcquireNonces {
                block: 0,
                key_type: KeyType::A,
            })
            .into(),
    );
}
