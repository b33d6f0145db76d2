//! Scripted client used by unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::client::{BeurerClient, DiscoveredDevice, LightInstance};
use crate::flow::UserInput;
use crate::mac::format_mac;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Discover,
    GetDevice(String),
    Connect(String),
    Update,
    TurnOn,
    TurnOff,
    Disconnect,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub calls: Vec<Call>,
    pub is_on: bool,
    pub fail_discover: bool,
    /// Number of upcoming `update` calls that fail
    pub fail_updates: usize,
    /// Number of upcoming `turn_on`/`turn_off` calls that fail
    pub fail_turns: usize,
    pub fail_disconnect: bool,
}

impl FakeState {
    pub fn count(&self, call: &Call) -> usize {
        self.calls.iter().filter(|c| *c == call).count()
    }
}

pub struct FakeClient {
    devices: Vec<DiscoveredDevice>,
    state: Arc<Mutex<FakeState>>,
}

impl FakeClient {
    pub fn new(devices: Vec<DiscoveredDevice>) -> (Self, Arc<Mutex<FakeState>>) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        (
            Self {
                devices,
                state: state.clone(),
            },
            state,
        )
    }
}

#[async_trait]
impl BeurerClient for FakeClient {
    async fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
        let mut state = self.state.lock();
        state.calls.push(Call::Discover);
        if state.fail_discover {
            return Err(Error::NoBluetoothAdapters);
        }
        Ok(self.devices.clone())
    }

    async fn get_device(&self, mac: &str) -> Result<Option<DiscoveredDevice>> {
        self.state.lock().calls.push(Call::GetDevice(mac.to_string()));
        Ok(self
            .devices
            .iter()
            .find(|d| format_mac(&d.address) == format_mac(mac))
            .cloned())
    }

    async fn connect(&self, device: &DiscoveredDevice) -> Result<Box<dyn LightInstance>> {
        self.state
            .lock()
            .calls
            .push(Call::Connect(device.address.clone()));
        Ok(Box::new(FakeInstance {
            state: self.state.clone(),
        }))
    }
}

struct FakeInstance {
    state: Arc<Mutex<FakeState>>,
}

impl FakeInstance {
    fn record(&self, call: Call) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(call.clone());
        let failing = match call {
            Call::Update => &mut state.fail_updates,
            Call::TurnOn | Call::TurnOff => &mut state.fail_turns,
            _ => return Ok(()),
        };
        if *failing > 0 {
            *failing -= 1;
            return Err(Error::BleError("simulated transport error".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LightInstance for FakeInstance {
    async fn update(&mut self) -> Result<()> {
        self.record(Call::Update)
    }

    fn is_on(&self) -> bool {
        self.state.lock().is_on
    }

    async fn turn_on(&mut self) -> Result<()> {
        self.record(Call::TurnOn)?;
        self.state.lock().is_on = true;
        Ok(())
    }

    async fn turn_off(&mut self) -> Result<()> {
        self.record(Call::TurnOff)?;
        self.state.lock().is_on = false;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Disconnect);
        if state.fail_disconnect {
            return Err(Error::BleError("simulated disconnect error".into()));
        }
        Ok(())
    }
}

/// Builds a form submission
pub fn input(fields: &[(&str, serde_json::Value)]) -> UserInput {
    fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
