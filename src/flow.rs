/*!
 # Pairing config flow

 A three step wizard that ends in a config entry for one Beurer light:

 * `user` lists discovered devices that are not configured yet, plus a manual option
 * `manual` asks for a MAC address and a name
 * `validate` flickers the light and asks the user whether it blinked

 The host drives the flow by calling [`BeurerFlowHandler::step`] with the step id
 of the last form it showed and the submitted values.
*/

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tokio::time;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{BeurerClient, DiscoveredDevice, LightInstance};
use crate::config::FlowConfig;
use crate::mac::format_mac;
use crate::{Error, Result};

/// Integration domain entries are created under
pub const DOMAIN: &str = "beurer";
/// Version stamped on created entries
pub const FLOW_VERSION: u32 = 1;

pub const STEP_USER: &str = "user";
pub const STEP_MANUAL: &str = "manual";
pub const STEP_VALIDATE: &str = "validate";

/// Value of the `mac` select that routes to manual entry
pub const MANUAL_MAC: &str = "manual";

pub const ABORT_CANNOT_CONNECT: &str = "cannot_connect";
pub const ABORT_CANNOT_VALIDATE: &str = "cannot_validate";

pub const CONF_MAC: &str = "mac";
pub const CONF_NAME: &str = "name";
pub const CONF_RETRY: &str = "retry";
pub const CONF_FLICKER: &str = "flicker";

/// Error key shown with the retry prompt
pub const ERROR_CONNECT: &str = "connect";

/// Values submitted with a form
pub type UserInput = serde_json::Map<String, Value>;

/// Option of a select field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOption {
    pub value: String,
    pub label: String,
}

/// Input widget of a form field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Bool,
    Select { options: Vec<SelectOption> },
}

/// One field of a form schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

impl FormField {
    pub fn required(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
        }
    }
}

/// Data stored in a created entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryData {
    pub mac: String,
    pub name: String,
}

/// What the host should do after a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowResult {
    /// Show a form and call back with the same step id
    Form {
        step_id: String,
        data_schema: Vec<FormField>,
        errors: BTreeMap<String, String>,
    },
    /// Persist a new config entry
    CreateEntry {
        title: String,
        unique_id: String,
        version: u32,
        data: EntryData,
    },
    /// End the flow without an entry
    Abort { reason: String },
}

impl FlowResult {
    fn form(step_id: &str, data_schema: Vec<FormField>) -> Self {
        FlowResult::Form {
            step_id: step_id.to_string(),
            data_schema,
            errors: BTreeMap::new(),
        }
    }

    fn abort(reason: &str) -> Self {
        FlowResult::Abort {
            reason: reason.to_string(),
        }
    }

    /// Step id of a form result
    pub fn step_id(&self) -> Option<&str> {
        match self {
            FlowResult::Form { step_id, .. } => Some(step_id.as_str()),
            _ => None,
        }
    }

    /// Names of the fields of a form result
    pub fn field_names(&self) -> Vec<&str> {
        match self {
            FlowResult::Form { data_schema, .. } => {
                data_schema.iter().map(|f| f.name.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Abort reason, if the flow was aborted
    pub fn abort_reason(&self) -> Option<&str> {
        match self {
            FlowResult::Abort { reason } => Some(reason.as_str()),
            _ => None,
        }
    }
}

/// Why the connectivity check failed
#[derive(thiserror::Error, Debug)]
pub enum ToggleError {
    /// The client could not resolve the address
    #[error("Device with MAC {0} not found")]
    DeviceNotFound(String),

    /// Connecting, reading or switching the light failed
    #[error(transparent)]
    Device(#[from] Error),
}

/// Session state of one pairing flow
pub struct BeurerFlowHandler {
    client: Box<dyn BeurerClient>,
    /// Unique ids of entries that already exist
    configured_ids: HashSet<String>,
    config: FlowConfig,
    mac: Option<String>,
    name: Option<String>,
    unique_id: Option<String>,
    /// Created on the first connectivity check and reused after
    instance: Option<Box<dyn LightInstance>>,
}

impl BeurerFlowHandler {
    pub fn new(
        client: Box<dyn BeurerClient>,
        configured_ids: impl IntoIterator<Item = String>,
        config: FlowConfig,
    ) -> Self {
        Self {
            client,
            configured_ids: configured_ids
                .into_iter()
                .map(|id| format_mac(&id))
                .collect(),
            config,
            mac: None,
            name: None,
            unique_id: None,
            instance: None,
        }
    }

    pub fn mac(&self) -> Option<&str> {
        self.mac.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.unique_id.as_deref()
    }

    /// Runs the step the host asked for
    pub async fn step(&mut self, step_id: &str, input: Option<UserInput>) -> Result<FlowResult> {
        match step_id {
            STEP_USER => self.step_user(input).await,
            STEP_MANUAL => self.step_manual(input).await,
            STEP_VALIDATE => self.step_validate(input).await,
            other => Err(Error::UnknownStep(other.to_string())),
        }
    }

    /// Discovery and device selection
    #[instrument(skip(self))]
    pub async fn step_user(&mut self, input: Option<UserInput>) -> Result<FlowResult> {
        if let Some(input) = input {
            let mac = string_field(&input, CONF_MAC)?;
            if mac == MANUAL_MAC {
                debug!("Manual entry selected");
                return self.step_manual(None).await;
            }

            let name = string_field(&input, CONF_NAME)?;
            self.set_device(mac, name);
            return self.step_validate(None).await;
        }

        let devices = match self.client.discover().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Discovery failed: {}", e);
                Vec::new()
            }
        };
        let devices: Vec<DiscoveredDevice> = devices
            .into_iter()
            .filter(|d| !self.configured_ids.contains(&format_mac(&d.address)))
            .collect();

        if devices.is_empty() {
            info!("No unconfigured devices found, asking for a MAC address");
            return self.step_manual(None).await;
        }

        debug!("Offering {} discovered devices", devices.len());
        Ok(user_form(&devices))
    }

    /// Manual MAC address entry
    #[instrument(skip(self))]
    pub async fn step_manual(&mut self, input: Option<UserInput>) -> Result<FlowResult> {
        if let Some(input) = input {
            let mac = string_field(&input, CONF_MAC)?;
            let name = string_field(&input, CONF_NAME)?;
            self.set_device(mac, name);
            return self.step_validate(None).await;
        }

        Ok(FlowResult::form(
            STEP_MANUAL,
            vec![
                FormField::required(CONF_MAC, FieldKind::String),
                FormField::required(CONF_NAME, FieldKind::String),
            ],
        ))
    }

    /// Connectivity check and flicker confirmation
    ///
    /// A failed check shows the retry prompt, every time. Only a successful
    /// check leads to the flicker prompt.
    #[instrument(skip(self))]
    pub async fn step_validate(&mut self, input: Option<UserInput>) -> Result<FlowResult> {
        if let Some(input) = input {
            if let Some(flicker) = bool_field(&input, CONF_FLICKER)? {
                if flicker {
                    return self.create_entry();
                }
                info!("Light did not flicker, aborting");
                return Ok(FlowResult::abort(ABORT_CANNOT_VALIDATE));
            }

            if bool_field(&input, CONF_RETRY)? == Some(false) {
                info!("Retry declined, aborting");
                return Ok(FlowResult::abort(ABORT_CANNOT_CONNECT));
            }
        }

        if let Err(e) = self.toggle_light().await {
            debug!("Connectivity check failed: {}", e);
            return Ok(FlowResult::Form {
                step_id: STEP_VALIDATE.to_string(),
                data_schema: vec![FormField::required(CONF_RETRY, FieldKind::Bool)],
                errors: BTreeMap::from([("base".to_string(), ERROR_CONNECT.to_string())]),
            });
        }

        Ok(FlowResult::form(
            STEP_VALIDATE,
            vec![FormField::required(CONF_FLICKER, FieldKind::Bool)],
        ))
    }

    /// Flickers the light once and restores its state
    ///
    /// Resolves and connects the device on first use. The instance is
    /// disconnected after every attempt; disconnect errors are only logged.
    #[instrument(skip(self), fields(mac = ?self.mac))]
    pub async fn toggle_light(&mut self) -> std::result::Result<(), ToggleError> {
        let mut instance = match self.instance.take() {
            Some(instance) => instance,
            None => {
                let mac = self
                    .mac
                    .clone()
                    .ok_or_else(|| Error::MissingField(CONF_MAC.to_string()))?;
                let Some(device) = self.client.get_device(&mac).await? else {
                    error!("No device with address {}", mac);
                    return Err(ToggleError::DeviceNotFound(mac));
                };
                self.client.connect(&device).await?
            }
        };

        let outcome = flicker(&mut *instance, &self.config).await;

        if let Err(e) = instance.disconnect().await {
            warn!("Disconnect failed: {}", e);
        }
        self.instance = Some(instance);

        outcome.map_err(|e| {
            error!("Flicker failed: {}", e);
            ToggleError::Device(e)
        })
    }

    fn set_device(&mut self, mac: String, name: String) {
        let unique_id = format_mac(&mac);
        info!("Validating {} ({})", name, unique_id);
        if self.mac.as_deref() != Some(mac.as_str()) {
            // A different address needs a fresh instance
            self.instance = None;
        }
        self.mac = Some(mac);
        self.name = Some(name);
        self.unique_id = Some(unique_id);
    }

    fn create_entry(&self) -> Result<FlowResult> {
        let (Some(mac), Some(name), Some(unique_id)) = (&self.mac, &self.name, &self.unique_id)
        else {
            return Err(Error::MissingField(CONF_MAC.to_string()));
        };

        info!("Creating entry {} for {}", unique_id, name);
        Ok(FlowResult::CreateEntry {
            title: name.clone(),
            unique_id: unique_id.clone(),
            version: FLOW_VERSION,
            data: EntryData {
                mac: mac.clone(),
                name: name.clone(),
            },
        })
    }
}

/// Reads the state, toggles to the opposite state and back
async fn flicker(instance: &mut dyn LightInstance, config: &FlowConfig) -> Result<()> {
    debug!("Reading light state");
    instance.update().await?;
    let was_on = instance.is_on();
    debug!("Light is {}", if was_on { "on" } else { "off" });

    // Give the connection a moment before writing
    time::sleep(config.settle_delay).await;

    if was_on {
        instance.turn_off().await?;
        time::sleep(config.flicker_delay).await;
        instance.turn_on().await?;
    } else {
        instance.turn_on().await?;
        time::sleep(config.flicker_delay).await;
        instance.turn_off().await?;
    }
    Ok(())
}

fn user_form(devices: &[DiscoveredDevice]) -> FlowResult {
    let mut options: Vec<SelectOption> = devices
        .iter()
        .map(|d| SelectOption {
            value: d.address.clone(),
            label: d.name.clone(),
        })
        .collect();
    options.push(SelectOption {
        value: MANUAL_MAC.to_string(),
        label: "Manually add a MAC address".to_string(),
    });

    FlowResult::form(
        STEP_USER,
        vec![
            FormField::required(CONF_MAC, FieldKind::Select { options }),
            FormField::required(CONF_NAME, FieldKind::String),
        ],
    )
}

fn string_field(input: &UserInput, key: &str) -> Result<String> {
    input
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::MissingField(key.to_string()))
}

fn bool_field(input: &UserInput, key: &str) -> Result<Option<bool>> {
    match input.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_bool()
            .map(Some)
            .ok_or_else(|| Error::MissingField(key.to_string())),
    }
}
