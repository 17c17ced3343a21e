//! Configuration loading for the xbeed daemon

use crate::{Result, XbeedError};
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    pub link: LinkConfig,
    pub socket_path: String,
    pub shm_name: String,
    pub radio: Option<RadioConfig>,
    pub timing: Option<TimingConfig>,
}

/// Endpoint of the radio gateway providing the framed byte stream
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
}

/// Modem bring-up parameters sent as local AT commands at startup
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RadioConfig {
    pub channel: Option<u8>,
    pub pan_id: Option<u16>,
    pub short_address_low: Option<u16>,
    pub short_address_high: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    pub request_timeout_ms: Option<u64>,
    pub scram_ms: Option<u64>,
    pub status_interval_secs: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
}

impl DaemonConfig {
    pub fn load_from_path(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| XbeedError::Config(format!("Failed to read {}: {}", path, e)))?;

        let config: DaemonConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Get radio configuration with defaults
    pub fn radio(&self) -> RadioConfig {
        self.radio.clone().unwrap_or_default()
    }

    /// Get timing configuration with defaults
    pub fn timing(&self) -> TimingConfig {
        self.timing.clone().unwrap_or_default()
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            channel: Some(0x0E),
            pan_id: Some(0x6666),
            short_address_low: Some(0x0001),
            short_address_high: Some(0x00FA),
        }
    }
}

impl RadioConfig {
    /// Get radio channel with default fallback
    pub fn channel(&self) -> u8 {
        self.channel.unwrap_or(0x0E)
    }

    /// Get PAN id with default fallback
    pub fn pan_id(&self) -> u16 {
        self.pan_id.unwrap_or(0x6666)
    }

    /// Get lowest allocatable short address with default fallback
    pub fn short_address_low(&self) -> u16 {
        self.short_address_low.unwrap_or(0x0001)
    }

    /// Get highest allocatable short address with default fallback
    pub fn short_address_high(&self) -> u16 {
        self.short_address_high.unwrap_or(0x00FA)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: Some(75),
            scram_ms: Some(500),
            status_interval_secs: Some(10),
            shutdown_grace_ms: Some(2000),
        }
    }
}

impl TimingConfig {
    /// Get per-request link timeout with default fallback
    pub fn request_timeout_ms(&self) -> u64 {
        self.request_timeout_ms.unwrap_or(75)
    }

    /// Get run-data staleness threshold with default fallback
    pub fn scram_ms(&self) -> u64 {
        self.scram_ms.unwrap_or(500)
    }

    /// Get status-line interval with default fallback
    pub fn status_interval_secs(&self) -> u64 {
        self.status_interval_secs.unwrap_or(10)
    }

    /// Get shutdown drain budget with default fallback
    pub fn shutdown_grace_ms(&self) -> u64 {
        self.shutdown_grace_ms.unwrap_or(2000)
    }
}
