use std::sync::Arc;
use std::time::Instant;

use batchflow_core::{AcceleratorBackend, LoadRequest, Result};
use batchflow_device::{assign_cores, BufferPool, BufferRole};
use batchflow_queue::QueueEnd;

use crate::batch::InferenceResult;
use crate::geometry::FlowGeometry;
use crate::state::{FlowState, Registration};

/// Load an execution context, bind it to its cores and run batches.
///
/// The first worker to get here also sizes the buffer pools and publishes
/// the registration every other stage waits on.
pub(crate) fn run_infer(state: &FlowState, backend: &dyn AcceleratorBackend) -> Result<()> {
    let index = state.next_infer_index();
    let config = &state.config;
    let accelerator = backend.load(&LoadRequest {
        model_path: config.model_path.clone(),
        function_name: config.function_name.clone(),
        device_id: config.device_id,
        data_parallelism: config.data_parallelism,
    })?;
    let geometry = FlowGeometry::derive(accelerator.as_ref())?;
    let cores = assign_cores(geometry.images_per_call(), index);
    accelerator.apply_cores(cores)?;
    tracing::info!(
        worker = index,
        context = accelerator.name(),
        core_count = cores.core_count,
        affinity = %format!("0x{:x}", cores.affinity),
        "infer context ready"
    );

    if state.claim_canonical() {
        let input_pool = Arc::new(BufferPool::new(
            Arc::clone(&accelerator),
            BufferRole::Input,
            config.pool_slots,
            geometry.input_bytes.clone(),
        )?);
        let output_pool = match BufferPool::new(
            Arc::clone(&accelerator),
            BufferRole::Output,
            config.pool_slots,
            geometry.output_bytes.clone(),
        ) {
            Ok(pool) => Arc::new(pool),
            Err(e) => {
                if let Err(free_err) = input_pool.destroy() {
                    tracing::warn!(error = %free_err, "failed to free input pool");
                }
                return Err(e);
            }
        };
        tracing::info!(
            images_per_call = geometry.images_per_call(),
            input_bytes = ?geometry.input_bytes,
            output_bytes = ?geometry.output_bytes,
            slots = config.pool_slots,
            "registered canonical model"
        );
        let registration = Registration {
            accelerator: Arc::clone(&accelerator),
            geometry: Arc::new(geometry),
            input_pool,
            output_pool,
        };
        if let Err(reg) = state.register(registration) {
            reg.input_pool.destroy()?;
            reg.output_pool.destroy()?;
            return Ok(());
        }
    }
    if state.wait_registration().is_none() {
        return Ok(());
    }

    loop {
        let batch = state.queues.batches.pop(QueueEnd::Head)?;
        if state.is_shutdown() {
            return Ok(());
        }

        let start = Instant::now();
        let device_us = accelerator.invoke(batch.input.buffers(), batch.output.buffers())?;
        let elapsed = start.elapsed().as_micros() as u64;
        state.queues.infer_latency.push(elapsed, QueueEnd::Tail)?;
        tracing::debug!(worker = index, images = batch.len(), device_us, elapsed_us = elapsed, "invoked batch");

        if state.queues.results.full() {
            tracing::warn!(capacity = state.queues.results.capacity(), "result queue full, infer blocking");
        }
        state
            .queues
            .results
            .push(InferenceResult { batch, device_us }, QueueEnd::Tail)?;
    }
}
