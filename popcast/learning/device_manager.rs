use std::{
    fmt,
    process::{Command, Stdio},
    thread,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Compute device a model and its batches are placed on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Host processor.
    #[default]
    Cpu,
    /// CUDA accelerator with the given ordinal.
    Cuda(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

/// Device metadata discovered on the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Placement handle.
    pub device: Device,
    /// Friendly device name.
    pub name: String,
    /// Total memory in bytes (best effort).
    pub memory_total_bytes: u64,
}

impl DeviceInfo {
    fn cpu_default() -> Self {
        let threads = thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        Self {
            device: Device::Cpu,
            name: format!("CPU ({threads} threads)"),
            memory_total_bytes: 0,
        }
    }
}

/// Requested placement for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DevicePreference {
    /// Use the accelerator with this ordinal when present, otherwise the CPU.
    Accelerator(usize),
    /// Restrict execution to the CPU.
    #[default]
    CpuOnly,
}

/// Errors emitted while probing for devices.
#[derive(Debug, Error)]
pub enum DeviceDetectionError {
    /// Command execution failed.
    #[error("failed to execute {command}: {message}")]
    CommandFailure {
        /// Command attempted (e.g., `nvidia-smi`).
        command: &'static str,
        /// Raw error payload.
        message: String,
    },
}

/// Discovers devices and resolves placement requests.
#[derive(Debug, Clone)]
pub struct DeviceManager {
    devices: Vec<DeviceInfo>,
}

impl DeviceManager {
    /// Autodetects devices on the host (best effort, CPU always present).
    #[must_use]
    pub fn autodetect() -> Self {
        let mut devices = vec![DeviceInfo::cpu_default()];
        if let Ok(accelerators) = detect_nvidia() {
            devices.extend(accelerators);
        }
        Self { devices }
    }

    /// Creates a manager from a predefined list of devices. The CPU is added when missing.
    #[must_use]
    pub fn from_devices(mut devices: Vec<DeviceInfo>) -> Self {
        if !devices.iter().any(|info| info.device == Device::Cpu) {
            devices.insert(0, DeviceInfo::cpu_default());
        }
        Self { devices }
    }

    /// Immutable view of known devices.
    #[must_use]
    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// Resolves a preference to a concrete device, falling back to the CPU.
    #[must_use]
    pub fn select(&self, preference: DevicePreference) -> Device {
        match preference {
            DevicePreference::CpuOnly => Device::Cpu,
            DevicePreference::Accelerator(ordinal) => self
                .devices
                .iter()
                .map(|info| info.device)
                .find(|device| *device == Device::Cuda(ordinal))
                .unwrap_or(Device::Cpu),
        }
    }
}

fn detect_nvidia() -> Result<Vec<DeviceInfo>, DeviceDetectionError> {
    let output = Command::new("nvidia-smi")
        .arg("--query-gpu=index,name,memory.total")
        .arg("--format=csv,noheader,nounits")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    let output = match output {
        Ok(out) if out.status.success() => out,
        Ok(out) => {
            return Err(DeviceDetectionError::CommandFailure {
                command: "nvidia-smi",
                message: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            })
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Vec::new());
        }
        Err(err) => {
            return Err(DeviceDetectionError::CommandFailure {
                command: "nvidia-smi",
                message: err.to_string(),
            })
        }
    };

    Ok(parse_nvidia_listing(&String::from_utf8_lossy(&output.stdout)))
}

fn parse_nvidia_listing(stdout: &str) -> Vec<DeviceInfo> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut parts = line.split(',').map(str::trim);
            let ordinal = parts
                .next()
                .and_then(|p| p.parse::<usize>().ok())
                .unwrap_or(0);
            let name = parts.next().unwrap_or("NVIDIA GPU").to_string();
            let memory_mib = parts
                .next()
                .and_then(|p| p.parse::<u64>().ok())
                .unwrap_or(0);
            DeviceInfo {
                device: Device::Cuda(ordinal),
                name,
                memory_total_bytes: memory_mib * 1024 * 1024,
            }
        })
        .collect()
}
