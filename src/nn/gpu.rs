use std::fmt;
use std::process::Command;

/// GPU information collected via nvidia-smi
#[derive(Debug, Clone)]
pub struct GpuInfo {
    pub name: String,
    pub vram_total_mb: u64,
    pub vram_used_mb: u64,
    pub utilization_percent: f32,
}

/// Requested compute device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// GPU when one is detected, CPU otherwise
    #[default]
    Auto,
    Cpu,
    Gpu,
}

/// Backend the pipeline actually runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeDevice {
    /// NdArray backend
    Cpu,
    /// Wgpu backend
    Gpu,
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeDevice::Cpu => write!(f, "CPU (NdArray)"),
            ComputeDevice::Gpu => write!(f, "GPU (Wgpu)"),
        }
    }
}

impl DevicePreference {
    pub fn resolve(self) -> ComputeDevice {
        self.resolve_with(detect_nvidia_gpu())
    }

    fn resolve_with(self, gpu: Option<GpuInfo>) -> ComputeDevice {
        match (self, gpu) {
            (DevicePreference::Cpu, _) => ComputeDevice::Cpu,
            (DevicePreference::Gpu, gpu) => {
                if gpu.is_none() {
                    tracing::warn!("No NVIDIA GPU detected, trying Wgpu anyway");
                }
                ComputeDevice::Gpu
            }
            (DevicePreference::Auto, Some(info)) => {
                tracing::info!(
                    "Detected GPU: {} ({} MB VRAM)",
                    info.name,
                    info.vram_total_mb
                );
                ComputeDevice::Gpu
            }
            (DevicePreference::Auto, None) => ComputeDevice::Cpu,
        }
    }
}

/// Detect an NVIDIA GPU by querying nvidia-smi.
/// Returns `Some(GpuInfo)` if an NVIDIA GPU is found, `None` otherwise.
pub fn detect_nvidia_gpu() -> Option<GpuInfo> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,memory.used,utilization.gpu",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
}

fn parse_nvidia_smi(stdout: &str) -> Option<GpuInfo> {
    // first GPU only
    let line = stdout.lines().next()?.trim();
    let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();

    if parts.len() < 4 {
        return None;
    }

    Some(GpuInfo {
        name: parts[0].to_string(),
        vram_total_mb: parts[1].parse().unwrap_or(0),
        vram_used_mb: parts[2].parse().unwrap_or(0),
        utilization_percent: parts[3].parse().unwrap_or(0.0),
    })
}
