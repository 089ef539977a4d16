lazy_static::lazy_static! {
    pub static ref WEBSOCKET_ADDRESS: String = std::env::var("WEBSOCKET_ADDRESS").unwrap_or_else(|_| "0.0.0.0:9001".to_owned());
    pub static ref DICTIONARY_FILE: String = std::env::var("DICTIONARY_FILE").unwrap_or_else(|_| "".to_owned());
    pub static ref SIMULATION_PROFILE: String = std::env::var("SIMULATION_PROFILE").unwrap_or_else(|_| "classic".to_owned());
    pub static ref SIMULATION_SEED: String = std::env::var("SIMULATION_SEED").unwrap_or_else(|_| "0".to_owned());
}
