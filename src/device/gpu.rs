use serde::{Deserialize, Serialize};
use std::fmt;
use sysinfo::System;
use tracing::{debug, info};

use crate::settings;

/// Fixed overhead a runner adds on a CUDA device before any weights load.
pub const CUDA_MINIMUM_MEMORY: u64 = 457 * 1024 * 1024;

/// Fixed overhead a runner adds on a ROCm device before any weights load.
pub const ROCM_MINIMUM_MEMORY: u64 = 457 * 1024 * 1024;

/// Accelerator vendor family.
///
/// Runners may span multiple accelerators of one library but never mix
/// libraries. `cpu` descriptors never participate in VRAM fitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuLibrary {
    Cuda,
    Rocm,
    Metal,
    Cpu,
}

impl GpuLibrary {
    pub fn as_str(&self) -> &'static str {
        match self {
            GpuLibrary::Cuda => "cuda",
            GpuLibrary::Rocm => "rocm",
            GpuLibrary::Metal => "metal",
            GpuLibrary::Cpu => "cpu",
        }
    }
}

impl fmt::Display for GpuLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One accelerator as seen at snapshot time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuDevice {
    /// Vendor family
    pub library: GpuLibrary,

    /// Stable identifier within a library
    pub id: String,

    /// Total device memory in bytes
    pub total_memory: u64,

    /// Free device memory in bytes at snapshot time
    pub free_memory: u64,

    /// Library-specific fixed overhead a runner adds before model weights
    pub minimum_memory: u64,
}

impl GpuDevice {
    pub fn new(
        library: GpuLibrary,
        id: impl Into<String>,
        total_memory: u64,
        free_memory: u64,
        minimum_memory: u64,
    ) -> Self {
        Self {
            library,
            id: id.into(),
            total_memory,
            // free can never exceed total
            free_memory: free_memory.min(total_memory),
            minimum_memory,
        }
    }
}

/// Snapshot of all visible accelerators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpuList(Vec<GpuDevice>);

impl GpuList {
    pub fn new(devices: Vec<GpuDevice>) -> Self {
        Self(devices)
    }

    pub fn devices(&self) -> &[GpuDevice] {
        &self.0
    }

    pub fn devices_mut(&mut self) -> &mut [GpuDevice] {
        &mut self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &GpuDevice> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the snapshot offers no VRAM to compete for.
    pub fn is_cpu_only(&self) -> bool {
        self.0.iter().all(|g| g.library == GpuLibrary::Cpu)
    }

    /// Sum of free memory across the snapshot.
    pub fn free_memory_total(&self) -> u64 {
        self.0.iter().map(|g| g.free_memory).sum()
    }

    /// Group devices by library, preserving first-seen order.
    ///
    /// `cpu` descriptors are excluded; they never join a VRAM fit.
    pub fn by_library(&self) -> Vec<GpuList> {
        let mut groups: Vec<GpuList> = Vec::new();
        for device in &self.0 {
            if device.library == GpuLibrary::Cpu {
                continue;
            }
            match groups
                .iter_mut()
                .find(|g| g.0[0].library == device.library)
            {
                Some(group) => group.0.push(device.clone()),
                None => groups.push(GpuList(vec![device.clone()])),
            }
        }
        groups
    }
}

impl From<Vec<GpuDevice>> for GpuList {
    fn from(devices: Vec<GpuDevice>) -> Self {
        Self(devices)
    }
}

impl IntoIterator for GpuList {
    type Item = GpuDevice;
    type IntoIter = std::vec::IntoIter<GpuDevice>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Source of accelerator snapshots.
///
/// The scheduler re-snapshots on every fit attempt; implementations must
/// return current numbers, not cached ones.
pub trait GpuDiscovery: Send + Sync {
    fn discover(&self) -> GpuList;
}

/// Default discovery: no vendor libraries, just what the host reveals.
///
/// Honors `HEARTH_MAX_VRAM` (or an explicit override) by synthesizing a
/// single CUDA-like device, which is how tests and CI exercise the VRAM
/// fitting paths on machines without accelerators.
pub struct SystemDiscovery {
    max_vram: Option<u64>,
}

impl SystemDiscovery {
    pub fn new() -> Self {
        Self { max_vram: None }
    }

    /// Pin the synthetic-device override (for testing)
    pub fn with_max_vram(max_vram: u64) -> Self {
        Self {
            max_vram: Some(max_vram),
        }
    }

    fn system_memory() -> (u64, u64) {
        let mut sys = System::new();
        sys.refresh_memory();
        (sys.total_memory(), sys.available_memory())
    }
}

impl Default for SystemDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDiscovery for SystemDiscovery {
    fn discover(&self) -> GpuList {
        if let Some(vram) = self.max_vram.or_else(settings::env_max_vram) {
            info!(bytes = vram, "accelerator discovery overridden by max-vram setting");
            return GpuList::new(vec![GpuDevice::new(
                GpuLibrary::Cuda,
                "override-0",
                vram,
                vram,
                CUDA_MINIMUM_MEMORY,
            )]);
        }

        let (total, available) = Self::system_memory();

        #[cfg(target_os = "macos")]
        {
            // Apple silicon exposes unified memory to metal
            debug!(total, available, "reporting unified memory as metal device");
            return GpuList::new(vec![GpuDevice::new(
                GpuLibrary::Metal,
                "0",
                total,
                available,
                0,
            )]);
        }

        #[cfg(not(target_os = "macos"))]
        {
            debug!(total, available, "no accelerator libraries found, reporting cpu");
            GpuList::new(vec![GpuDevice::new(
                GpuLibrary::Cpu,
                "0",
                total,
                available,
                0,
            )])
        }
    }
}
