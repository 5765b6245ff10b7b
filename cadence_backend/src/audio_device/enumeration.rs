use std::fmt;

use cpal::traits::{DeviceTrait, HostTrait};
use thiserror::Error;

const COMMON_SAMPLE_RATES: [u32; 9] = [8000, 11025, 16000, 22050, 32000, 44100, 48000, 88200, 96000];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub id: cpal::HostId,
    pub name: String,
    pub is_available: bool,
    pub is_default: bool,
}

impl fmt::Display for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, if self.is_default { "default" } else { "available" })
    }
}

/// One capture-capable device and what it supports.
#[derive(Clone, Debug)]
pub struct InputDeviceInfo {
    pub name: String,
    pub host_id: cpal::HostId,
    pub is_default: bool,

    pub supported_sample_rates: Vec<u32>,
    pub min_sample_rate: u32,
    pub max_sample_rate: u32,
    pub default_sample_rate: u32,

    pub max_channels: u16,
    pub default_channels: u16,
    pub default_sample_format: cpal::SampleFormat,

    pub(crate) device_index: usize,
}

impl fmt::Display for InputDeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}ch @ {}Hz {:?}]{}",
            self.name,
            self.default_channels,
            self.default_sample_rate,
            self.default_sample_format,
            if self.is_default { " (default)" } else { "" }
        )
    }
}

pub type EnumResult<T> = Result<T, EnumError>;

#[derive(Debug, Error)]
pub enum EnumError {
    #[error("No input devices found")]
    NoDevicesFound,

    #[error("Input device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device query failed: {0}")]
    QueryFailed(String),
}

/// Snapshot of the input devices on every available host.
pub struct InputDeviceEnumerator {
    hosts: Vec<HostInfo>,
    devices: Vec<(cpal::Device, InputDeviceInfo)>,
}

impl InputDeviceEnumerator {
    pub fn new() -> EnumResult<Self> {
        let hosts = Self::enumerate_hosts();
        let devices = Self::scan_input_devices(&hosts)?;
        Ok(Self { hosts, devices })
    }

    pub fn enumerate_hosts() -> Vec<HostInfo> {
        let default_host_id = cpal::default_host().id();
        cpal::ALL_HOSTS
            .iter()
            .map(|&id| HostInfo {
                id,
                name: id.name().to_string(),
                is_available: cpal::host_from_id(id).is_ok(),
                is_default: id == default_host_id,
            })
            .collect()
    }

    fn scan_input_devices(hosts: &[HostInfo]) -> EnumResult<Vec<(cpal::Device, InputDeviceInfo)>> {
        let mut found = Vec::new();

        for host_info in hosts.iter().filter(|h| h.is_available) {
            let Ok(host) = cpal::host_from_id(host_info.id) else {
                continue;
            };
            let default_name = host.default_input_device().and_then(|d| d.name().ok());

            let Ok(devices) = host.input_devices() else {
                continue;
            };
            for device in devices {
                let index = found.len();
                match Self::query_device_info(&device, host_info.id, default_name.as_deref(), index) {
                    Ok(info) => found.push((device, info)),
                    Err(e) => tracing::debug!(error = %e, host = %host_info.name, "skipping input device"),
                }
            }
        }

        if found.is_empty() {
            return Err(EnumError::NoDevicesFound);
        }
        Ok(found)
    }

    fn query_device_info(
        device: &cpal::Device,
        host_id: cpal::HostId,
        default_name: Option<&str>,
        device_index: usize,
    ) -> EnumResult<InputDeviceInfo> {
        let name = device
            .name()
            .map_err(|e| EnumError::QueryFailed(format!("Failed to get device name: {e}")))?;
        let default_config = device
            .default_input_config()
            .map_err(|e| EnumError::QueryFailed(format!("Failed to get default config: {e}")))?;
        let configs = device
            .supported_input_configs()
            .map_err(|e| EnumError::QueryFailed(format!("Failed to get supported configs: {e}")))?;

        let mut sample_rates = Vec::new();
        let mut min_sample_rate = u32::MAX;
        let mut max_sample_rate = 0u32;
        let mut max_channels = 0u16;
        for range in configs {
            let (lo, hi) = (range.min_sample_rate().0, range.max_sample_rate().0);
            min_sample_rate = min_sample_rate.min(lo);
            max_sample_rate = max_sample_rate.max(hi);
            sample_rates.extend(COMMON_SAMPLE_RATES.iter().filter(|&&r| r >= lo && r <= hi));
            max_channels = max_channels.max(range.channels());
        }
        sample_rates.sort_unstable();
        sample_rates.dedup();

        Ok(InputDeviceInfo {
            is_default: default_name == Some(name.as_str()),
            name,
            host_id,
            supported_sample_rates: sample_rates,
            min_sample_rate,
            max_sample_rate,
            default_sample_rate: default_config.sample_rate().0,
            max_channels,
            default_channels: default_config.channels(),
            default_sample_format: default_config.sample_format(),
            device_index,
        })
    }

    pub fn available_hosts(&self) -> Vec<&HostInfo> {
        self.hosts.iter().filter(|h| h.is_available).collect()
    }

    pub fn input_devices(&self) -> Vec<&InputDeviceInfo> {
        self.devices.iter().map(|(_, info)| info).collect()
    }

    /// Default input of the default host, else the first default found.
    pub fn default_input_device(&self) -> EnumResult<&InputDeviceInfo> {
        let default_host = self.hosts.iter().find(|h| h.is_default).map(|h| h.id);
        let defaults = || self.devices.iter().map(|(_, info)| info).filter(|info| info.is_default);
        defaults()
            .find(|info| Some(info.host_id) == default_host)
            .or_else(|| defaults().next())
            .ok_or(EnumError::NoDevicesFound)
    }

    /// Case-insensitive; exact match wins over substring match.
    pub fn find_device_by_name(&self, name: &str) -> EnumResult<&InputDeviceInfo> {
        let needle = name.to_lowercase();
        let infos = || self.devices.iter().map(|(_, info)| info);
        infos()
            .find(|info| info.name.to_lowercase() == needle)
            .or_else(|| infos().find(|info| info.name.to_lowercase().contains(&needle)))
            .ok_or_else(|| EnumError::DeviceNotFound(name.to_string()))
    }

    /// The cpal handle behind `info`.
    pub fn select_device(&self, info: &InputDeviceInfo) -> EnumResult<&cpal::Device> {
        self.devices
            .iter()
            .find(|(_, candidate)| candidate.device_index == info.device_index)
            .map(|(device, _)| device)
            .ok_or_else(|| EnumError::DeviceNotFound(info.name.clone()))
    }

    pub fn print_device_list(&self) {
        println!("Available Audio Hosts:");
        for host in self.available_hosts() {
            println!("  {host}");
        }
        println!();

        println!("Input Devices:");
        for (idx, device) in self.input_devices().iter().enumerate() {
            println!("  [{idx}] {device}");
            println!("      Sample rates: {} - {} Hz", device.min_sample_rate, device.max_sample_rate);
            println!("      Channels: {} (max: {})", device.default_channels, device.max_channels);
        }
    }
}
