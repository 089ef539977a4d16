#[macro_use]
extern crate hex_literal;

pub mod application;
pub mod env;

mod errors;
pub use errors::*;

pub mod nfc_module;
pub mod websocket_server;
