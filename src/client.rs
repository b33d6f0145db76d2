/*!
 # Device client interface

 The pairing flow only needs a handful of operations from a Bluetooth client:
 find devices, resolve one address, connect, read the power state and switch the
 light on or off. They are expressed as traits so the flow runs against the
 btleplug binding in [`crate::device`] or any other backend.
*/

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// A device seen while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Hardware address as reported by the Bluetooth stack
    pub address: String,
    /// Advertised local name
    pub name: String,
}

impl DiscoveredDevice {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }
}

/// Finds devices and opens instances for them
#[async_trait]
pub trait BeurerClient: Send + Sync {
    /// Scans for nearby compatible devices
    async fn discover(&self) -> Result<Vec<DiscoveredDevice>>;

    /// Looks up a single device by MAC address
    async fn get_device(&self, mac: &str) -> Result<Option<DiscoveredDevice>>;

    /// Creates an instance for a resolved device
    ///
    /// The instance may connect lazily on its first operation.
    async fn connect(&self, device: &DiscoveredDevice) -> Result<Box<dyn LightInstance>>;
}

/// A handle to one device
#[async_trait]
pub trait LightInstance: Send {
    /// Refreshes the cached state from the device
    async fn update(&mut self) -> Result<()>;

    /// Power state as of the last update or command
    fn is_on(&self) -> bool;

    /// Turns the light on
    async fn turn_on(&mut self) -> Result<()>;

    /// Turns the light off
    async fn turn_off(&mut self) -> Result<()>;

    /// Drops the Bluetooth connection
    async fn disconnect(&mut self) -> Result<()>;
}
