// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration of the MCTP daemon.
//!
//! The daemon is configured from a JSON file naming the active binding and
//! its bus parameters, plus the protocol tuning knobs (retry budgets,
//! reassembly deadline, EID pool range). The engine and bindings only ever
//! see the validated [`Config`]; raw configuration text never crosses into
//! them.

use crate::smbus::SMBUS_MAX_MTU;
use crate::Error;
use mctpd_wire::Eid;
use mctpd_wire::BASELINE_MTU;
use mctpd_wire::MAX_MTU;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

/// The configuration path used when none is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "/usr/share/mctpd/config.json";

/// Return the default service identity published at startup.
pub fn default_service_name() -> String {
    String::from("mctpd")
}

/// Return the default EID of the daemon itself.
pub const fn default_own_eid() -> Eid {
    Eid(8)
}

/// Return the default lower bound of the assignable EID pool.
pub const fn default_eid_start() -> u8 {
    1
}

/// Return the default upper bound of the assignable EID pool.
pub const fn default_eid_end() -> u8 {
    254
}

/// Return the default deadline for an in-progress reassembly, after which
/// its context is evicted.
pub const fn default_reassembly_deadline_ms() -> u64 {
    5000
}

/// Return the default period of the engine's timer events (reassembly sweep
/// and discovery retry checks).
pub const fn default_sweep_interval_ms() -> u64 {
    500
}

/// Return the default number of attempts for one discovery exchange before
/// the peer is marked unreachable.
pub const fn default_discovery_attempts() -> u32 {
    3
}

/// Return the default delay between discovery attempts.
pub const fn default_discovery_backoff_ms() -> u64 {
    1000
}

/// Return the default number of retries for a transiently-busy transmit.
pub const fn default_transmit_retries() -> usize {
    3
}

/// Return the default delay between transmit retries.
pub const fn default_transmit_backoff_ms() -> u64 {
    20
}

/// Return the default bound on a reassembled message's size.
pub const fn default_max_message_size() -> usize {
    64 * 1024
}

/// Return the default binding MTU.
pub const fn default_mtu() -> usize {
    BASELINE_MTU
}

/// Configuration for the daemon.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The stable service identity published at startup.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// The daemon's own endpoint ID.
    #[serde(default = "default_own_eid")]
    pub own_eid: Eid,

    /// The inclusive lower bound of the assignable EID pool.
    #[serde(default = "default_eid_start")]
    pub eid_start: u8,

    /// The inclusive upper bound of the assignable EID pool.
    #[serde(default = "default_eid_end")]
    pub eid_end: u8,

    /// Milliseconds an in-progress reassembly may sit idle before its
    /// context is evicted.
    #[serde(default = "default_reassembly_deadline_ms")]
    pub reassembly_deadline_ms: u64,

    /// The period of the engine's timer events, in milliseconds.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// The number of attempts for one discovery exchange before the peer is
    /// marked unreachable.
    #[serde(default = "default_discovery_attempts")]
    pub discovery_attempts: u32,

    /// Milliseconds between discovery attempts.
    #[serde(default = "default_discovery_backoff_ms")]
    pub discovery_backoff_ms: u64,

    /// The number of retries for a transmit that finds the bus busy.
    #[serde(default = "default_transmit_retries")]
    pub transmit_retries: usize,

    /// Milliseconds between transmit retries.
    #[serde(default = "default_transmit_backoff_ms")]
    pub transmit_backoff_ms: u64,

    /// The largest message the daemon will reassemble or send.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// The active binding and its bus parameters.
    pub binding: BindingConfig,
}

impl Config {
    /// Load and validate a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        let config: Config =
            serde_json::from_str(&text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the cross-field constraints a deserialized configuration must
    /// satisfy.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.own_eid.is_assignable() {
            return Err(Error::Config(format!(
                "own EID {} is a reserved value",
                self.own_eid
            )));
        }
        if self.eid_start > self.eid_end {
            return Err(Error::Config(format!(
                "EID pool range {}..={} is empty",
                self.eid_start, self.eid_end
            )));
        }
        if !Eid(self.eid_start).is_assignable() || !Eid(self.eid_end).is_assignable() {
            return Err(Error::Config(format!(
                "EID pool range {}..={} includes reserved values",
                self.eid_start, self.eid_end
            )));
        }
        if self.discovery_attempts == 0 {
            return Err(Error::Config(String::from(
                "discovery attempt budget must be at least 1",
            )));
        }
        if self.max_message_size == 0 {
            return Err(Error::Config(String::from(
                "maximum message size must be nonzero",
            )));
        }
        match &self.binding {
            BindingConfig::Smbus(smbus) => {
                if smbus.own_address > 0x7F {
                    return Err(Error::Config(format!(
                        "SMBus address 0x{:02x} does not fit in 7 bits",
                        smbus.own_address
                    )));
                }
                if !(BASELINE_MTU..=SMBUS_MAX_MTU).contains(&smbus.mtu) {
                    return Err(Error::Config(format!(
                        "SMBus MTU {} outside {BASELINE_MTU}..={SMBUS_MAX_MTU}",
                        smbus.mtu
                    )));
                }
                for addr in &smbus.probe {
                    if *addr > 0x7F {
                        return Err(Error::Config(format!(
                            "probe address 0x{addr:02x} does not fit in 7 bits"
                        )));
                    }
                }
            }
            BindingConfig::Pcie(pcie) => {
                if !(BASELINE_MTU..=MAX_MTU).contains(&pcie.mtu) {
                    return Err(Error::Config(format!(
                        "PCIe MTU {} outside {BASELINE_MTU}..={MAX_MTU}",
                        pcie.mtu
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn reassembly_deadline(&self) -> Duration {
        Duration::from_millis(self.reassembly_deadline_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn discovery_backoff(&self) -> Duration {
        Duration::from_millis(self.discovery_backoff_ms)
    }

    pub fn transmit_backoff(&self) -> Duration {
        Duration::from_millis(self.transmit_backoff_ms)
    }
}

/// The closed set of supported bindings, each with its own parameters.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BindingConfig {
    Smbus(SmbusConfig),
    Pcie(PcieConfig),
}

impl BindingConfig {
    pub fn kind(&self) -> BindingKind {
        match self {
            BindingConfig::Smbus(_) => BindingKind::Smbus,
            BindingConfig::Pcie(_) => BindingKind::Pcie,
        }
    }
}

/// The binding selector given on the command line.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum BindingKind {
    Smbus,
    Pcie,
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingKind::Smbus => write!(f, "smbus"),
            BindingKind::Pcie => write!(f, "pcie"),
        }
    }
}

/// Bus parameters for the SMBus (byte-stream) binding.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SmbusConfig {
    /// The character device carrying the bus byte stream.
    pub device: PathBuf,

    /// Our own 7-bit bus address.
    pub own_address: u8,

    /// Bus addresses to probe for endpoints at startup.
    ///
    /// SMBus has no out-of-band attach events, so peers known ahead of time
    /// are listed here; anything else is found through its own traffic or
    /// an explicit discover request.
    #[serde(default)]
    pub probe: Vec<u8>,

    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

/// Bus parameters for the PCIe (frame-oriented) binding.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PcieConfig {
    /// The character device exchanging whole frames with the bus driver.
    pub device: PathBuf,

    /// The character device on which the driver reports link events.
    pub monitor_device: PathBuf,

    /// Our own requester ID.
    pub bdf: u16,

    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

#[cfg(test)]
mod tests {
    use super::BindingConfig;
    use super::BindingKind;
    use super::Config;
    use crate::Error;
    use std::io::Write;

    fn smbus_json() -> &'static str {
        r#"{
            "binding": {
                "kind": "smbus",
                "device": "/dev/i2c-mctp0",
                "own_address": 16
            }
        }"#
    }

    #[test]
    fn test_config_defaults() {
        let config: Config = serde_json::from_str(smbus_json()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.service_name, "mctpd");
        assert_eq!(config.own_eid, super::default_own_eid());
        assert_eq!(config.eid_start, 1);
        assert_eq!(config.eid_end, 254);
        assert_eq!(config.binding.kind(), BindingKind::Smbus);
        let BindingConfig::Smbus(smbus) = &config.binding else {
            panic!("expected an smbus binding");
        };
        assert_eq!(smbus.mtu, super::default_mtu());
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(smbus_json().as_bytes()).unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.binding.kind(), BindingKind::Smbus);
    }

    #[test]
    fn test_config_missing_file() {
        assert!(matches!(
            Config::from_file("/nonexistent/mctpd.json"),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_config_unknown_binding_kind() {
        let text = r#"{ "binding": { "kind": "usb", "device": "/dev/x" } }"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_config_pcie() {
        let text = r#"{
            "binding": {
                "kind": "pcie",
                "device": "/dev/aspeed-mctp",
                "monitor_device": "/dev/aspeed-mctp-events",
                "bdf": 512,
                "mtu": 128
            }
        }"#;
        let config: Config = serde_json::from_str(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.binding.kind(), BindingKind::Pcie);
    }

    #[test]
    fn test_config_rejects_reserved_own_eid() {
        let text = r#"{
            "own_eid": 0,
            "binding": { "kind": "smbus", "device": "/dev/x", "own_address": 16 }
        }"#;
        let config: Config = serde_json::from_str(text).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_config_rejects_bad_pool_range() {
        let text = r#"{
            "eid_start": 200,
            "eid_end": 100,
            "binding": { "kind": "smbus", "device": "/dev/x", "own_address": 16 }
        }"#;
        let config: Config = serde_json::from_str(text).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_config_rejects_wide_smbus_address() {
        let text = r#"{
            "binding": { "kind": "smbus", "device": "/dev/x", "own_address": 200 }
        }"#;
        let config: Config = serde_json::from_str(text).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_config_probe_addresses() {
        let text = r#"{
            "binding": {
                "kind": "smbus",
                "device": "/dev/x",
                "own_address": 16,
                "probe": [50, 65]
            }
        }"#;
        let config: Config = serde_json::from_str(text).unwrap();
        config.validate().unwrap();
        let BindingConfig::Smbus(smbus) = &config.binding else {
            panic!("expected an smbus binding");
        };
        assert_eq!(smbus.probe, vec![50, 65]);
    }

    #[test]
    fn test_config_rejects_wide_probe_address() {
        let text = r#"{
            "binding": {
                "kind": "smbus",
                "device": "/dev/x",
                "own_address": 16,
                "probe": [200]
            }
        }"#;
        let config: Config = serde_json::from_str(text).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_config_rejects_oversize_smbus_mtu() {
        let text = r#"{
            "binding": { "kind": "smbus", "device": "/dev/x", "own_address": 16, "mtu": 1024 }
        }"#;
        let config: Config = serde_json::from_str(text).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
