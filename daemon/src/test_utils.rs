// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared helpers for the unit tests.

use crate::config::BindingConfig;
use crate::config::Config;
use crate::config::SmbusConfig;
use slog::o;
use slog::Discard;
use slog::Logger;
use std::path::PathBuf;

pub fn test_logger() -> Logger {
    Logger::root(Discard, o!())
}

pub fn test_smbus_config() -> SmbusConfig {
    SmbusConfig {
        device: PathBuf::from("/dev/null"),
        own_address: 0x20,
        probe: Vec::new(),
        mtu: 64,
    }
}

/// A configuration with the stock defaults and an in-memory-friendly SMBus
/// binding. Tests that care about a knob override it on the result.
pub fn test_config() -> Config {
    let config = Config {
        service_name: crate::config::default_service_name(),
        own_eid: crate::config::default_own_eid(),
        eid_start: crate::config::default_eid_start(),
        eid_end: crate::config::default_eid_end(),
        reassembly_deadline_ms: crate::config::default_reassembly_deadline_ms(),
        sweep_interval_ms: crate::config::default_sweep_interval_ms(),
        discovery_attempts: crate::config::default_discovery_attempts(),
        discovery_backoff_ms: crate::config::default_discovery_backoff_ms(),
        transmit_retries: crate::config::default_transmit_retries(),
        transmit_backoff_ms: crate::config::default_transmit_backoff_ms(),
        max_message_size: crate::config::default_max_message_size(),
        binding: BindingConfig::Smbus(test_smbus_config()),
    };
    config.validate().expect("test defaults are valid");
    config
}
