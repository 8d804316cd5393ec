//! # Device Detection
//!
//! Picks the compute device handed to the inference runner. Detection probes
//! candle's CUDA and Metal backends once and caches the answer; an explicit
//! preference that is not available falls back to CPU with a warning.

use candle_core::Device;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Cached auto-detected device tag
static BEST_DEVICE: OnceLock<&'static str> = OnceLock::new();

/// Device preference from `model.device`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Best available device
    #[default]
    Auto,
    Cpu,
    /// NVIDIA GPU (falls back to CPU)
    Cuda,
    /// Apple Silicon GPU (falls back to CPU)
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" | "mps" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

pub struct DeviceManager;

impl DeviceManager {
    /// Device tag ("cpu", "cuda", "metal") for a preference.
    pub fn resolve(preference: DevicePreference) -> &'static str {
        match preference {
            DevicePreference::Auto => Self::best_device(),
            DevicePreference::Cpu => "cpu",
            DevicePreference::Cuda => {
                if Self::cuda_available() {
                    "cuda"
                } else {
                    warn!("CUDA requested but not available, falling back to CPU");
                    "cpu"
                }
            }
            DevicePreference::Metal => {
                if Self::metal_available() {
                    "metal"
                } else {
                    warn!("Metal requested but not available, falling back to CPU");
                    "cpu"
                }
            }
        }
    }

    /// Best available device (cached after the first probe).
    pub fn best_device() -> &'static str {
        BEST_DEVICE.get_or_init(|| {
            info!("Detecting best available compute device...");
            if Self::cuda_available() {
                info!("Selected CUDA GPU for separation");
                "cuda"
            } else if Self::metal_available() {
                info!("Selected Metal GPU for separation");
                "metal"
            } else {
                info!("Using CPU for separation (no GPU acceleration available)");
                "cpu"
            }
        })
    }

    fn cuda_available() -> bool {
        match Device::new_cuda(0) {
            Ok(_) => true,
            Err(e) => {
                debug!("CUDA not available: {}", e);
                false
            }
        }
    }

    fn metal_available() -> bool {
        match Device::new_metal(0) {
            Ok(_) => true,
            Err(e) => {
                debug!("Metal not available: {}", e);
                false
            }
        }
    }
}

/// Resolve a configured preference string, treating unknown values as `auto`.
pub fn device_from_string(device_str: &str) -> &'static str {
    match device_str.parse::<DevicePreference>() {
        Ok(preference) => DeviceManager::resolve(preference),
        Err(_) => {
            warn!("Invalid device preference '{}', using auto", device_str);
            DeviceManager::best_device()
        }
    }
}
