pub mod device;
pub mod errors;
pub mod model;
pub mod observability;
pub mod runner;
pub mod sched;
pub mod settings;

pub use device::{GpuDevice, GpuDiscovery, GpuLibrary, GpuList, SystemDiscovery};
pub use errors::{ErrorContext, HearthError, Result};
pub use model::{ManifestLoader, MetadataLoader, ModelMetadata, ModelSpec};
pub use observability::{init_cli, init_daemon};
pub use runner::{
    CompletionChunk, CompletionRequest, Runner, RunnerFactory, RunnerOptions,
};
pub use sched::{ActiveRunner, RunnerRef, Scheduler};
pub use settings::{format_bytes, parse_memory_string, KeepAlive, Settings};
