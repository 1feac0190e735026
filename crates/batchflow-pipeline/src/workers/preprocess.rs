use std::time::Instant;

use batchflow_core::{HostImage, ImageLoader, PathEntry, RawImage, Result};
use batchflow_preprocess::{load_or_blank, Preprocessor};
use batchflow_queue::QueueEnd;

use crate::batch::PreparedBatch;
use crate::state::{FlowState, Registration};

/// Build device-ready batches: decode (unless loader workers already
/// did), letterbox, pack, lease both buffer sets and copy the input in.
pub(crate) fn run_preprocess(state: &FlowState, loader: &dyn ImageLoader) -> Result<()> {
    let Some(reg) = state.wait_registration() else {
        return Ok(());
    };
    let pre = Preprocessor::new(reg.geometry.pack_layout(state.config.channel_order));
    let per_call = reg.geometry.images_per_call();
    let decode_inline = state.config.parallelism.loaders == 0;

    loop {
        let (start, inputs): (Instant, Vec<(PathEntry, RawImage)>) = if decode_inline {
            let entries = state.queues.paths.pop_upto_n(per_call, QueueEnd::Head)?;
            // Inline decode is part of this stage's latency.
            let start = Instant::now();
            let inputs = entries
                .into_iter()
                .map(|entry| {
                    let image = load_or_blank(loader, &entry.path);
                    (entry, image)
                })
                .collect();
            (start, inputs)
        } else {
            let inputs = state
                .queues
                .raw_images
                .pop_upto_n(per_call, QueueEnd::Head)?
                .into_iter()
                .map(|loaded| (loaded.entry, loaded.image))
                .collect();
            (Instant::now(), inputs)
        };
        if state.is_shutdown() {
            return Ok(());
        }

        if inputs.len() < per_call {
            tracing::warn!(
                images = inputs.len(),
                per_call,
                "partial batch, padding remaining slots"
            );
        }

        let images = inputs
            .into_iter()
            .map(|(entry, raw)| prepare_or_blank(&pre, entry, &raw))
            .collect::<Result<Vec<_>>>()?;
        let batch = stage(&reg, &pre, images)?;

        let elapsed = start.elapsed().as_micros() as u64;
        state.queues.preprocess_latency.push(elapsed, QueueEnd::Tail)?;
        tracing::debug!(
            images = batch.len(),
            input_slot = ?batch.input.slot(),
            output_slot = ?batch.output.slot(),
            elapsed_us = elapsed,
            "prepared batch"
        );

        if state.queues.batches.full() {
            tracing::warn!(capacity = state.queues.batches.capacity(), "batch queue full, preprocess blocking");
        }
        state.queues.batches.push(batch, QueueEnd::Tail)?;
    }
}

fn prepare_or_blank(pre: &Preprocessor, entry: PathEntry, raw: &RawImage) -> Result<HostImage> {
    match pre.prepare(entry.clone(), raw) {
        Ok(img) => Ok(img),
        Err(e) => {
            tracing::warn!(seq = entry.seq, path = %entry.path.display(), error = %e, "preprocess failed, substituting blank");
            pre.prepare(entry, &RawImage::blank(1, 1, 3))
        }
    }
}

fn stage(reg: &Registration, pre: &Preprocessor, images: Vec<HostImage>) -> Result<PreparedBatch> {
    let packed = pre.pack(&images)?;
    let staged = reg.geometry.stage_input(&packed)?;

    let input = reg.input_pool.lease()?;
    let output = reg.output_pool.lease()?;
    if let Some(first) = input.buffers().first() {
        reg.accelerator.copy_host_to_device(first, &staged)?;
    }

    Ok(PreparedBatch {
        images,
        input,
        output,
    })
}
