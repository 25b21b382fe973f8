//! Device selection for training and mining
//!
//! The device is chosen once per run and handed to every component that
//! allocates tensors.

use anyhow::Result;
use candle_core::Device;
use serde::{Deserialize, Serialize};

/// Device preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    Cuda,
    Metal,
    Cpu,
    #[default]
    Auto,
}

impl std::str::FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cuda" | "gpu" | "cuda:0" => Ok(Self::Cuda),
            "metal" => Ok(Self::Metal),
            "cpu" => Ok(Self::Cpu),
            "auto" => Ok(Self::Auto),
            _ => Err(anyhow::anyhow!(
                "Invalid device preference: {}. Valid options: cuda, metal, cpu, auto",
                s
            )),
        }
    }
}

impl std::fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Metal => write!(f, "metal"),
            Self::Cpu => write!(f, "cpu"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// Select device based on preference
///
/// An explicit GPU request that cannot be honored is an error; only `Auto`
/// falls back to the CPU.
pub fn select_device(preference: DevicePreference) -> Result<Device> {
    match preference {
        DevicePreference::Cuda => {
            #[cfg(feature = "cuda")]
            {
                let device = Device::new_cuda(0)?;
                tracing::info!("CUDA device selected");
                Ok(device)
            }
            #[cfg(not(feature = "cuda"))]
            {
                anyhow::bail!("CUDA requested but not compiled with 'cuda' feature")
            }
        }

        DevicePreference::Metal => {
            #[cfg(feature = "metal")]
            {
                let device = Device::new_metal(0)?;
                tracing::info!("Metal device selected");
                Ok(device)
            }
            #[cfg(not(feature = "metal"))]
            {
                anyhow::bail!("Metal requested but not compiled with 'metal' feature")
            }
        }

        DevicePreference::Cpu => {
            tracing::info!("CPU device selected");
            Ok(Device::Cpu)
        }

        DevicePreference::Auto => {
            #[cfg(feature = "cuda")]
            {
                if let Ok(device) = Device::new_cuda(0) {
                    tracing::info!("Auto-selected: CUDA GPU");
                    return Ok(device);
                }
            }

            #[cfg(feature = "metal")]
            {
                if let Ok(device) = Device::new_metal(0) {
                    tracing::info!("Auto-selected: Metal GPU");
                    return Ok(device);
                }
            }

            tracing::info!("Auto-selected: CPU");
            Ok(Device::Cpu)
        }
    }
}

/// Short label for logs and trainer state
pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda:0",
        Device::Metal(_) => "metal:0",
    }
}

/// Enable reduced-precision f32 matmuls (TF32) where the backend supports it
///
/// Returns whether the flag took effect.
pub fn enable_tf32(device: &Device) -> bool {
    match device {
        #[cfg(feature = "cuda")]
        Device::Cuda(_) => {
            candle_core::cuda::set_gemm_reduced_precision_f32(true);
            true
        }
        _ => false,
    }
}
