//! Accelerator discovery and descriptors
//!
//! The scheduler consumes immutable [`GpuList`] snapshots. Real probing of
//! vendor libraries lives behind the [`GpuDiscovery`] seam; the default
//! [`SystemDiscovery`] reports what it can observe without vendor
//! libraries (system memory, a metal device on macOS) and honors the
//! `HEARTH_MAX_VRAM` testing override.

mod gpu;

pub use gpu::{
    GpuDevice, GpuDiscovery, GpuLibrary, GpuList, SystemDiscovery, CUDA_MINIMUM_MEMORY,
    ROCM_MINIMUM_MEMORY,
};
