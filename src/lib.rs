/*!
 # Beurer Bluetooth Light Pairing Flow

 A Rust library for pairing Beurer Bluetooth lights (TL100 daylight lamps and
 similar light/massage devices) with a home automation host.

 ## Features

 * Discovery of nearby devices, skipping those already configured
 * Manual MAC address entry
 * Connectivity check by flickering the light and restoring its state
 * Config entries keyed by the normalized MAC address

 ## Example

 ```rust,no_run
 use beurer_pair::*;

 #[tokio::main]
 async fn main() -> Result<()> {
     tracing_subscriber::fmt::init();

     let config = FlowConfig::default();
     let client = BleClient::new(config).await?;
     let store = EntryStore::open("beurer_entries.json")?;

     let mut flow = BeurerFlowHandler::new(Box::new(client), store.current_ids(), config);

     // First step: discovered devices plus the manual option
     let result = flow.step(STEP_USER, None).await?;
     println!("{}", serde_json::to_string_pretty(&result)?);

     Ok(())
 }
 ```
*/

use thiserror::Error;

/// Custom error types for the Beurer pairing library
#[derive(Error, Debug)]
pub enum Error {
    /// No Bluetooth adapters found
    #[error("No Bluetooth adapters found")]
    NoBluetoothAdapters,

    /// Failed to find required BLE characteristic
    #[error("Could not find required BLE characteristic: {0}")]
    CharacteristicNotFound(String),

    /// BLE communication error
    #[error("BLE communication error: {0}")]
    BleError(String),

    /// Command timeout
    #[error("Command timed out after {0} retries")]
    CommandTimeout(u8),

    /// Operation needs a connected device
    #[error("Device {0} is not connected")]
    NotConnected(String),

    /// The host asked for a step this flow does not have
    #[error("Unknown config flow step: {0}")]
    UnknownStep(String),

    /// Submitted form is missing a field or has the wrong type
    #[error("Missing or invalid form field: {0}")]
    MissingField(String),

    /// Config entry store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Error from btleplug
    #[error(transparent)]
    BtlePlugError(#[from] btleplug::Error),

    /// JSON (de)serialization error
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod client;
pub mod config;
pub mod device;
pub mod entries;
pub mod flow;
pub mod mac;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types
pub use client::{BeurerClient, DiscoveredDevice, LightInstance};
pub use config::FlowConfig;
pub use device::{BeurerInstance, BleClient};
pub use entries::{ConfigEntry, EntryStore};
pub use flow::{
    BeurerFlowHandler, EntryData, FieldKind, FlowResult, FormField, SelectOption, ToggleError,
    UserInput, ABORT_CANNOT_CONNECT, ABORT_CANNOT_VALIDATE, DOMAIN, MANUAL_MAC, STEP_MANUAL,
    STEP_USER, STEP_VALIDATE,
};
pub use mac::format_mac;
