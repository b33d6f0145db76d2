use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::client::{BeurerClient, DiscoveredDevice, LightInstance};
use crate::config::FlowConfig;
use crate::mac::format_mac;
use crate::{Error, Result};

/// Characteristic commands are written to
pub const WRITE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x8b00ace7_eb0b_49b0_bbe9_9aee0a26e1a3);

/// Characteristic the device sends status notifications on
pub const READ_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0734594a_a8e7_4b1a_a6b1_cd5243059a57);

/// Query the white light status
pub const CMD_QUERY_STATUS: [u8; 2] = [0x30, 0x01];
/// Turn the white light on
pub const CMD_LIGHT_ON: [u8; 2] = [0x37, 0x01];
/// Turn the white light off
pub const CMD_LIGHT_OFF: [u8; 2] = [0x35, 0x01];

/// Advertised name prefixes of supported devices (lowercase)
const NAME_PREFIXES: [&str; 3] = ["tl100", "tl 100", "beurer"];

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);
const STATUS_REPLY_TIMEOUT: Duration = Duration::from_secs(2);
const COMMAND_MIN_DELAY_MS: u64 = 50;

/// Gets the default Bluetooth adapter
#[instrument(skip(manager))]
async fn get_central(manager: &Manager) -> Result<Adapter> {
    debug!("Getting default Bluetooth adapter");
    let adapters = manager.adapters().await?;
    let Some(adapter) = adapters.into_iter().next() else {
        error!("No Bluetooth adapters found");
        return Err(Error::NoBluetoothAdapters);
    };

    debug!("Using Bluetooth adapter");
    Ok(adapter)
}

/// Whether an advertised name belongs to a supported device
pub fn is_beurer_name(name: &str) -> bool {
    let name = name.to_lowercase();
    NAME_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// Wraps a payload in the device packet frame
///
/// `FE EF 0A <len+7> AB AA <len+2> <payload> <checksum> 55 0D 0A`, where the
/// checksum is `len+2` xor every payload byte.
pub fn build_packet(payload: &[u8]) -> Vec<u8> {
    let length = payload.len() as u8;
    let checksum = payload
        .iter()
        .fold(length.wrapping_add(2), |acc, byte| acc ^ byte);

    let mut packet = vec![
        0xfe,
        0xef,
        0x0a,
        length.wrapping_add(7),
        0xab,
        0xaa,
        length.wrapping_add(2),
    ];
    packet.extend_from_slice(payload);
    packet.extend_from_slice(&[checksum, 0x55, 0x0d, 0x0a]);
    packet
}

/// Extracts the white light power flag from a status notification
///
/// Byte 8 is the reply mode (1 = white light), byte 9 the on flag. Replies for
/// other modes are ignored.
pub fn parse_status(data: &[u8]) -> Option<bool> {
    if data.len() < 10 || data[..3] != [0xfe, 0xef, 0x0a] {
        return None;
    }
    match data[8] {
        1 => Some(data[9] == 1),
        _ => None,
    }
}

/// Command queue to manage Bluetooth commands with rate limiting
struct CommandQueue {
    /// Semaphore to limit command concurrency
    semaphore: Semaphore,
    /// Minimum delay between commands
    min_delay: Duration,
    /// Last command timestamp
    last_command: Mutex<std::time::Instant>,
}

impl CommandQueue {
    fn new(min_delay_ms: u64) -> Self {
        Self {
            semaphore: Semaphore::new(1), // Only allow one command at a time
            min_delay: Duration::from_millis(min_delay_ms),
            last_command: Mutex::new(std::time::Instant::now() - Duration::from_secs(1)),
        }
    }

    async fn execute<T, F>(&self, future: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>> + Send,
        T: Send,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| Error::BleError(e.to_string()))?;

        let mut last_cmd = self.last_command.lock().await;
        let elapsed = last_cmd.elapsed();
        if elapsed < self.min_delay {
            let wait_time = self.min_delay - elapsed;
            trace!("Rate limiting: waiting {:?} before next command", wait_time);
            time::sleep(wait_time).await;
        }

        let result = future.await;

        *last_cmd = std::time::Instant::now();

        result
    }
}

/// Runs `poll` between `start` and `stop`, stopping even when `poll` fails
///
/// A failed stop is only returned when `poll` itself succeeded.
async fn scan_window<T>(
    start: impl Future<Output = Result<()>>,
    poll: impl Future<Output = Result<T>>,
    stop: impl Future<Output = Result<()>>,
) -> Result<T> {
    start.await?;
    let polled = poll.await;
    let stopped = stop.await;

    match (polled, stopped) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), stopped) => {
            if let Err(stop_err) = stopped {
                warn!("Failed to stop scan after error: {}", stop_err);
            }
            Err(e)
        }
    }
}

/// Bluetooth client backed by btleplug
pub struct BleClient {
    /// Adapter used for scanning
    central: Adapter,
    /// How long a scan runs
    discovery_timeout: Duration,
    /// Pause after each power command
    command_delay: Duration,
    /// Peripherals seen by earlier scans, keyed by normalized address
    seen: SyncMutex<HashMap<String, Peripheral>>,
}

impl BleClient {
    /// Opens the default Bluetooth adapter
    #[instrument(skip(config))]
    pub async fn new(config: FlowConfig) -> Result<BleClient> {
        info!("Initializing Beurer BLE client");
        let manager = Manager::new().await?;
        let central = get_central(&manager).await?;

        Ok(BleClient {
            central,
            discovery_timeout: config.discovery_timeout,
            command_delay: config.command_delay,
            seen: SyncMutex::new(HashMap::new()),
        })
    }

    /// Scans for supported devices, or for one address when `target` is set
    ///
    /// With a target the scan stops as soon as that address shows up.
    #[instrument(skip(self))]
    async fn scan(&self, target: Option<&str>) -> Result<Vec<DiscoveredDevice>> {
        info!("Scanning for Beurer devices...");
        scan_window(
            async {
                self.central
                    .start_scan(ScanFilter::default())
                    .await
                    .map_err(Error::from)
            },
            self.poll_scan(target),
            async { self.central.stop_scan().await.map_err(Error::from) },
        )
        .await
    }

    /// Polls the running scan until the timeout or until `target` is seen
    async fn poll_scan(&self, target: Option<&str>) -> Result<Vec<DiscoveredDevice>> {
        let target = target.map(format_mac);
        let start_time = std::time::Instant::now();
        let mut found: Vec<DiscoveredDevice> = Vec::new();

        while start_time.elapsed() < self.discovery_timeout {
            let peripherals = self.central.peripherals().await?;
            debug!("Found {} BLE peripherals so far", peripherals.len());

            for p in peripherals {
                let Ok(Some(props)) = p.properties().await else {
                    continue;
                };
                let address = p.address().to_string();
                let key = format_mac(&address);
                if found.iter().any(|d| format_mac(&d.address) == key) {
                    continue;
                }
                let name = props.local_name.unwrap_or_default();

                match &target {
                    Some(mac) => {
                        let id = p.id().to_string().to_lowercase();
                        if key != *mac && id != *mac {
                            continue;
                        }
                        debug!("Found requested device: {} {}", address, name);
                        self.seen.lock().insert(key, p);
                        return Ok(vec![DiscoveredDevice::new(address, name)]);
                    }
                    None => {
                        if !is_beurer_name(&name) {
                            trace!("Skipping unsupported device: {} {}", address, name);
                            continue;
                        }
                        info!("Found compatible device: {} ({})", name, address);
                        self.seen.lock().insert(key, p);
                        found.push(DiscoveredDevice::new(address, name));
                    }
                }
            }

            let remaining = self
                .discovery_timeout
                .saturating_sub(start_time.elapsed())
                .as_secs();
            debug!("Still scanning... ({} seconds remaining)", remaining);
            time::sleep(SCAN_POLL_INTERVAL).await;
        }

        info!("Scan finished with {} compatible devices", found.len());
        Ok(found)
    }
}

#[async_trait]
impl BeurerClient for BleClient {
    async fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
        self.scan(None).await
    }

    async fn get_device(&self, mac: &str) -> Result<Option<DiscoveredDevice>> {
        Ok(self.scan(Some(mac)).await?.into_iter().next())
    }

    async fn connect(&self, device: &DiscoveredDevice) -> Result<Box<dyn LightInstance>> {
        let key = format_mac(&device.address);
        let cached = self.seen.lock().get(&key).cloned();
        let peripheral = match cached {
            Some(p) => p,
            None => {
                self.scan(Some(device.address.as_str())).await?;
                let found = self.seen.lock().get(&key).cloned();
                found.ok_or_else(|| Error::BleError(format!("Device {} not found", device.address)))?
            }
        };

        Ok(Box::new(BeurerInstance::new(
            peripheral,
            device.address.clone(),
            self.command_delay,
        )))
    }
}

/// One Beurer light reached over Bluetooth LE
///
/// The connection is opened on the first operation and reopened after
/// [`LightInstance::disconnect`].
pub struct BeurerInstance {
    /// The Bluetooth peripheral
    peripheral: Peripheral,
    /// Address used in logs and errors
    address: String,
    /// Characteristic used for sending commands, set once connected
    write_characteristic: Option<Characteristic>,
    /// Characteristic status notifications arrive on, set once connected
    read_characteristic: Option<Characteristic>,
    /// Command queue for rate limiting
    command_queue: Arc<CommandQueue>,
    /// Current power state
    is_on: bool,
    /// Pause after each power command
    command_delay: Duration,
}

impl BeurerInstance {
    pub fn new(peripheral: Peripheral, address: String, command_delay: Duration) -> Self {
        Self {
            peripheral,
            address,
            write_characteristic: None,
            read_characteristic: None,
            command_queue: Arc::new(CommandQueue::new(COMMAND_MIN_DELAY_MS)),
            is_on: false,
            command_delay,
        }
    }

    /// Connects and resolves characteristics if needed
    #[instrument(skip(self), fields(address = %self.address))]
    async fn ensure_connected(&mut self) -> Result<()> {
        if self.write_characteristic.is_some() && self.peripheral.is_connected().await? {
            return Ok(());
        }

        info!("Connecting to device...");
        if !self.peripheral.is_connected().await? {
            self.peripheral.connect().await?;
        }

        debug!("Discovering services...");
        self.peripheral.discover_services().await?;

        let characteristics = self.peripheral.characteristics();
        let write_char = characteristics
            .iter()
            .find(|c| c.uuid == WRITE_CHARACTERISTIC_UUID)
            .cloned()
            .ok_or(Error::CharacteristicNotFound(
                WRITE_CHARACTERISTIC_UUID.to_string(),
            ))?;
        debug!("Found write characteristic: {}", write_char.uuid);

        let read_char = characteristics
            .iter()
            .find(|c| c.uuid == READ_CHARACTERISTIC_UUID)
            .cloned()
            .ok_or(Error::CharacteristicNotFound(
                READ_CHARACTERISTIC_UUID.to_string(),
            ))?;
        debug!("Found read characteristic: {}", read_char.uuid);

        self.peripheral.subscribe(&read_char).await?;

        self.write_characteristic = Some(write_char);
        self.read_characteristic = Some(read_char);
        info!("Connected to {}", self.address);
        Ok(())
    }

    /// Sends a framed command with retries and rate limiting
    #[instrument(skip(self, payload), fields(cmd = payload.first().copied().unwrap_or_default()))]
    async fn send_command(&self, payload: &[u8]) -> Result<()> {
        let write_characteristic = self
            .write_characteristic
            .clone()
            .ok_or_else(|| Error::NotConnected(self.address.clone()))?;
        let packet = build_packet(payload);
        let peripheral = self.peripheral.clone();

        self.command_queue
            .execute(async move {
                // BLE can be unreliable, so we implement retries
                let max_retries = 3;
                let mut attempt = 0;

                let write_type = if write_characteristic
                    .properties
                    .contains(CharPropFlags::WRITE)
                {
                    WriteType::WithResponse
                } else {
                    WriteType::WithoutResponse
                };

                while attempt < max_retries {
                    trace!(
                        "Sending BLE command (attempt {}/{})",
                        attempt + 1,
                        max_retries
                    );

                    match peripheral
                        .write(&write_characteristic, &packet, write_type)
                        .await
                    {
                        Ok(_) => {
                            trace!("Command sent successfully");
                            return Ok(());
                        }
                        Err(e) => {
                            attempt += 1;
                            warn!(
                                "Command failed (attempt {}/{}): {}",
                                attempt, max_retries, e
                            );

                            if attempt < max_retries {
                                time::sleep(Duration::from_millis(300)).await;
                            } else {
                                error!("Command failed permanently: {}", e);
                                return Err(Error::BleError(e.to_string()));
                            }
                        }
                    }
                }

                Err(Error::CommandTimeout(max_retries))
            })
            .await
    }
}

#[async_trait]
impl LightInstance for BeurerInstance {
    #[instrument(skip(self))]
    async fn update(&mut self) -> Result<()> {
        self.ensure_connected().await?;

        // Subscribe before querying so the reply is not missed
        let mut notifications = self.peripheral.notifications().await?;
        self.send_command(&CMD_QUERY_STATUS).await?;

        let reply = time::timeout(STATUS_REPLY_TIMEOUT, async {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != READ_CHARACTERISTIC_UUID {
                    continue;
                }
                trace!("Status notification: {:02x?}", notification.value);
                if let Some(on) = parse_status(&notification.value) {
                    return Some(on);
                }
            }
            None
        })
        .await;

        match reply {
            Ok(Some(on)) => {
                self.is_on = on;
                debug!("Light is {}", if on { "on" } else { "off" });
                Ok(())
            }
            Ok(None) => Err(Error::BleError("Notification stream closed".into())),
            Err(_) => Err(Error::BleError(format!(
                "No status reply within {:?}",
                STATUS_REPLY_TIMEOUT
            ))),
        }
    }

    fn is_on(&self) -> bool {
        self.is_on
    }

    #[instrument(skip(self))]
    async fn turn_on(&mut self) -> Result<()> {
        self.ensure_connected().await?;
        debug!("Turning light on");
        self.send_command(&CMD_LIGHT_ON).await?;
        self.is_on = true;

        time::sleep(self.command_delay).await;
        info!("Light powered on");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn turn_off(&mut self) -> Result<()> {
        self.ensure_connected().await?;
        debug!("Turning light off");
        self.send_command(&CMD_LIGHT_OFF).await?;
        self.is_on = false;

        time::sleep(self.command_delay).await;
        info!("Light powered off");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn disconnect(&mut self) -> Result<()> {
        self.write_characteristic = None;
        self.read_characteristic = None;
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
            info!("Disconnected from {}", self.address);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_light_on_packet() {
        assert_eq!(
            build_packet(&CMD_LIGHT_ON),
            vec![0xfe, 0xef, 0x0a, 0x09, 0xab, 0xaa, 0x04, 0x37, 0x01, 0x32, 0x55, 0x0d, 0x0a]
        );
    }

    #[test]
    fn test_query_packet_checksum() {
        let packet = build_packet(&CMD_QUERY_STATUS);
        // 0x04 ^ 0x30 ^ 0x01
        assert_eq!(packet[9], 0x35);
        assert_eq!(packet.len(), 13);
    }

    #[test]
    fn test_parse_status() {
        let on = [0xfe, 0xef, 0x0a, 0x0b, 0xab, 0xaa, 0x06, 0xd1, 0x01, 0x01, 0x32];
        let off = [0xfe, 0xef, 0x0a, 0x0b, 0xab, 0xaa, 0x06, 0xd1, 0x01, 0x00, 0x32];
        let color = [0xfe, 0xef, 0x0a, 0x0b, 0xab, 0xaa, 0x06, 0xd2, 0x02, 0x01, 0x32];
        assert_eq!(parse_status(&on), Some(true));
        assert_eq!(parse_status(&off), Some(false));
        assert_eq!(parse_status(&color), None);
        assert_eq!(parse_status(&[0x00; 4]), None);
    }

    #[tokio::test]
    async fn test_scan_window_stops_after_failed_poll() {
        let calls = Arc::new(SyncMutex::new(Vec::new()));
        let record = |name: &'static str| {
            let calls = calls.clone();
            async move {
                calls.lock().push(name);
                Ok::<_, Error>(())
            }
        };

        let result: Result<()> = scan_window(
            record("start"),
            async { Err::<(), _>(Error::BleError("adapter gone".into())) },
            record("stop"),
        )
        .await;

        assert!(matches!(result, Err(Error::BleError(_))));
        assert_eq!(*calls.lock(), vec!["start", "stop"]);
    }

    #[tokio::test]
    async fn test_scan_window_reports_poll_error_over_stop_error() {
        let result: Result<()> = scan_window(
            async { Ok::<_, Error>(()) },
            async { Err::<(), _>(Error::BleError("poll".into())) },
            async { Err::<(), _>(Error::NoBluetoothAdapters) },
        )
        .await;
        assert!(matches!(result, Err(Error::BleError(m)) if m == "poll"));

        let result = scan_window(
            async { Ok::<_, Error>(()) },
            async { Ok::<_, Error>(3) },
            async { Err::<(), _>(Error::NoBluetoothAdapters) },
        )
        .await;
        assert!(matches!(result, Err(Error::NoBluetoothAdapters)));
    }

    #[tokio::test]
    async fn test_scan_window_skips_poll_when_start_fails() {
        let polled = SyncMutex::new(false);
        let result: Result<()> = scan_window(
            async { Err::<(), _>(Error::NoBluetoothAdapters) },
            async {
                *polled.lock() = true;
                Ok::<_, Error>(())
            },
            async { Ok::<_, Error>(()) },
        )
        .await;

        assert!(result.is_err());
        assert!(!*polled.lock());
    }

    #[test]
    fn test_name_filter() {
        assert!(is_beurer_name("TL100"));
        assert!(is_beurer_name("Beurer TL 100"));
        assert!(is_beurer_name("tl 100 lamp"));
        assert!(!is_beurer_name("ELK-BLEDOM"));
        assert!(!is_beurer_name(""));
    }
}
