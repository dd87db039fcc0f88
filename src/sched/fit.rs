//! Accelerator memory fit prediction
//!
//! Pure and cheap: the scheduler calls this once per candidate
//! accelerator grouping during a fit search, so nothing here touches the
//! registry or blocks.

use crate::device::{GpuLibrary, GpuList};
use crate::model::{auxiliary_file_size, ModelMetadata};
use crate::runner::RunnerOptions;
use crate::settings::format_bytes;
use std::path::PathBuf;
use tracing::debug;

/// Outcome of a fit attempt against one accelerator set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitReport {
    /// Whether the requested offload is satisfied on some library group
    pub fits: bool,

    /// Bytes the load is predicted to claim
    pub estimated_vram: u64,

    /// Whether every layer (plus output) landed on the accelerators, or
    /// the user-pinned layer count was met
    pub fully_offloaded: bool,

    /// Repeating layers that fit, plus one when the output layer does
    pub layer_count: u64,
}

/// Effective context window: clamped into `[4, model maximum]`, raised to
/// 2048 when any projector is present (multimodal minimum).
pub fn effective_num_ctx(
    options: &RunnerOptions,
    metadata: &ModelMetadata,
    projectors: &[PathBuf],
) -> u64 {
    let mut num_ctx = options.num_ctx.min(metadata.context_length).max(4);
    if !projectors.is_empty() {
        num_ctx = num_ctx.max(2048);
    }
    num_ctx
}

/// Will this model load with the requested offload on the given
/// accelerators? Tries each library group in turn.
pub fn predict_fit(
    all_gpus: &GpuList,
    metadata: &ModelMetadata,
    projectors: &[PathBuf],
    options: &RunnerOptions,
) -> FitReport {
    let mut last = FitReport {
        fits: false,
        estimated_vram: 0,
        fully_offloaded: false,
        layer_count: 0,
    };

    for group in all_gpus.by_library() {
        let report = predict_layers(&group, metadata, projectors, options);
        if report.fully_offloaded {
            return FitReport { fits: true, ..report };
        }
        last = report;
    }

    last
}

/// Predict how many layers and bytes one same-library accelerator group
/// can take.
///
/// Layers are considered in index order; offloading stops at the first
/// layer that would exceed the available memory.
pub fn predict_layers(
    group: &GpuList,
    metadata: &ModelMetadata,
    projectors: &[PathBuf],
    options: &RunnerOptions,
) -> FitReport {
    let none = FitReport {
        fits: false,
        estimated_vram: 0,
        fully_offloaded: false,
        layer_count: 0,
    };

    let Some(first) = group.devices().first() else {
        return none;
    };
    if first.library == GpuLibrary::Cpu {
        return none;
    }

    let available: u64 = group.free_memory_total();
    debug!(
        library = %first.library,
        gpu_count = group.len(),
        available = %format_bytes(available),
        "evaluating fit"
    );

    let mut memory_minimum = first.minimum_memory;
    for projector in projectors {
        memory_minimum += auxiliary_file_size(projector);
    }

    let num_ctx = effective_num_ctx(options, metadata, projectors);

    // fp16 k,v = (1 (k) + 1 (v)) * sizeof(float16) * n_ctx * n_layer * n_embd / n_head * n_head_kv
    let kv: u64 = 2 * 2 * num_ctx * metadata.block_count * metadata.embedding_length
        / metadata.head_count.max(1)
        * metadata.head_count_kv;

    let batch = num_ctx.min(options.num_batch);
    let (mut graph_partial, mut graph_full) =
        metadata.graph_size(num_ctx, batch).unwrap_or((0, 0));
    if graph_partial == 0 {
        graph_partial = metadata.gqa() * kv / 6;
    }
    if graph_full == 0 {
        graph_full = graph_partial;
    }

    // required for full offload (all layers) vs partial (0 < n < layers)
    let mut required_total = memory_minimum + graph_full;
    let mut required_partial = memory_minimum + graph_partial;

    if first.library != GpuLibrary::Metal && required_partial > available {
        debug!("insufficient accelerator memory to load any model layers");
        return FitReport {
            fits: false,
            estimated_vram: required_partial,
            fully_offloaded: false,
            layer_count: 0,
        };
    }

    let mut layer_count: u64 = 0;
    for i in 0..metadata.block_count {
        // KV is proportional to the number of layers
        let memory_layer = metadata.layer_size(&i.to_string()) + kv / metadata.block_count.max(1);

        required_total += memory_layer;
        if available > required_partial + memory_layer {
            required_partial += memory_layer;
            layer_count += 1;
        }
    }

    required_total += metadata.layer_size("output");
    if available > required_total {
        layer_count = metadata.block_count + 1;
        required_partial = required_total;
    }

    let fully_offloaded = if options.num_gpu < 0 {
        layer_count >= metadata.block_count + 1
    } else {
        layer_count >= options.num_gpu as u64
    };

    debug!(
        layers = layer_count,
        required = %format_bytes(required_total),
        used = %format_bytes(required_partial),
        available = %format_bytes(available),
        kv = %format_bytes(kv),
        full_offload = %format_bytes(graph_full),
        partial_offload = %format_bytes(graph_partial),
        "offload prediction"
    );

    FitReport {
        fits: fully_offloaded,
        estimated_vram: required_total,
        fully_offloaded,
        layer_count,
    }
}
