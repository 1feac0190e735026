use std::time::Instant;

use batchflow_core::{clock, CompletionMarker, DeviceMemory, FlowError, Result};
use batchflow_queue::QueueEnd;

use crate::batch::InferenceResult;
use crate::state::{EpochOutcome, FlowState, Registration};

/// Copy outputs back, return both sets and emit one completion marker per
/// real image. The worker whose markers complete an epoch reports it.
pub(crate) fn run_postprocess(state: &FlowState) -> Result<()> {
    let Some(reg) = state.wait_registration() else {
        return Ok(());
    };

    loop {
        let result = state.queues.results.pop(QueueEnd::Head)?;
        if state.is_shutdown() {
            return Ok(());
        }

        let start = Instant::now();
        let InferenceResult { batch, device_us } = result;
        let outputs = read_outputs(&reg, batch.output.buffers())?;
        for (i, img) in batch.images.iter().enumerate() {
            for (tensor, host) in outputs.iter().enumerate() {
                if reg.geometry.image_output(tensor, host, i).is_none() {
                    return Err(FlowError::Device(format!(
                        "output tensor {tensor} too small for image {i} (seq {})",
                        img.seq
                    )));
                }
            }
        }
        batch.input.release()?;
        batch.output.release()?;

        let count = batch.images.len() as u64;
        for img in &batch.images {
            state
                .queues
                .completions
                .push(CompletionMarker::new(img.seq, clock::now_us()), QueueEnd::Tail)?;
        }
        let elapsed = start.elapsed().as_micros() as u64;
        state.queues.postprocess_latency.push(elapsed, QueueEnd::Tail)?;
        tracing::debug!(images = count, device_us, elapsed_us = elapsed, "completed batch");

        if state.record_completions(count) {
            match state.finish_epoch()? {
                EpochOutcome::Resubmitted => {}
                EpochOutcome::Final => {
                    let solo = solo_latency(&reg)?;
                    tracing::info!(solo_latency_us = solo, "final epoch complete");
                    state.set_solo_latency(solo);
                    state.shutdown();
                    return Ok(());
                }
            }
        }
    }
}

fn read_outputs(reg: &Registration, buffers: &[DeviceMemory]) -> Result<Vec<Vec<f32>>> {
    buffers
        .iter()
        .map(|mem| {
            let bytes = reg.accelerator.copy_device_to_host(mem)?;
            Ok(bytemuck::pod_collect_to_vec::<u8, f32>(&bytes))
        })
        .collect()
}

/// Time one invocation with nothing else in flight.
fn solo_latency(reg: &Registration) -> Result<u64> {
    let input = reg.input_pool.lease()?;
    let output = reg.output_pool.lease()?;
    let start = Instant::now();
    reg.accelerator.invoke(input.buffers(), output.buffers())?;
    let elapsed = start.elapsed().as_micros() as u64;
    input.release()?;
    output.release()?;
    Ok(elapsed)
}
