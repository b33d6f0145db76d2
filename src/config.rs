/*!
 # Flow timing configuration

 Fixed delays used by the connectivity check, plus the scan window and command
 pacing used by the Bluetooth client. The binaries expose these as command line flags.
*/

use std::time::Duration;

/// Default pause after reading the light state before toggling it
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Default time the light stays in the toggled state
pub const DEFAULT_FLICKER_DELAY: Duration = Duration::from_secs(2);

/// Default scan window for discovery and address lookup
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default pause after each power command sent to a light
pub const DEFAULT_COMMAND_DELAY: Duration = Duration::from_millis(100);

/// Timings for one pairing session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowConfig {
    /// Pause between the state read and the first toggle
    pub settle_delay: Duration,
    /// How long the light is held in the opposite state
    pub flicker_delay: Duration,
    /// How long to scan for devices
    pub discovery_timeout: Duration,
    /// Pause after each power command
    pub command_delay: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            flicker_delay: DEFAULT_FLICKER_DELAY,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            command_delay: DEFAULT_COMMAND_DELAY,
        }
    }
}

impl FlowConfig {
    /// Builds a config from millisecond/second values as given on the command line
    ///
    /// The command delay keeps its default; see [`FlowConfig::with_command_delay`].
    pub fn from_millis(settle_ms: u64, flicker_ms: u64, scan_secs: u64) -> Self {
        Self {
            settle_delay: Duration::from_millis(settle_ms),
            flicker_delay: Duration::from_millis(flicker_ms),
            discovery_timeout: Duration::from_secs(scan_secs),
            command_delay: DEFAULT_COMMAND_DELAY,
        }
    }

    pub fn with_command_delay(self, command_ms: u64) -> Self {
        Self {
            command_delay: Duration::from_millis(command_ms),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FlowConfig::default();
        assert_eq!(config.settle_delay, Duration::from_millis(500));
        assert_eq!(config.flicker_delay, Duration::from_secs(2));
        assert_eq!(config.discovery_timeout, Duration::from_secs(10));
        assert_eq!(config.command_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_with_command_delay() {
        let config = FlowConfig::from_millis(0, 0, 1).with_command_delay(250);
        assert_eq!(config.command_delay, Duration::from_millis(250));
        assert_eq!(config.discovery_timeout, Duration::from_secs(1));
        assert_eq!(
            FlowConfig::default().with_command_delay(100),
            FlowConfig::default()
        );
    }

    #[test]
    fn test_from_millis_matches_defaults() {
        assert_eq!(FlowConfig::from_millis(500, 2000, 10), FlowConfig::default());
    }
}
