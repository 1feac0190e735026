//! Stage worker loops.
//!
//! Each worker runs on its own named thread until the flow shuts down. A
//! closed queue or pool is the normal exit path; any other error cancels
//! the whole flow.

mod infer;
mod load;
mod postprocess;
mod preprocess;
mod source;

pub(crate) use infer::run_infer;
pub(crate) use load::run_loader;
pub(crate) use postprocess::run_postprocess;
pub(crate) use preprocess::run_preprocess;
pub(crate) use source::run_source;

use std::sync::Arc;
use std::thread::JoinHandle;

use batchflow_core::{FlowError, Result};

use crate::state::FlowState;

/// Spawn `body` on a thread called `name`, routing its failure into
/// [`FlowState::cancel`].
pub(crate) fn spawn_worker<F>(name: String, state: Arc<FlowState>, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce(&FlowState) -> Result<()> + Send + 'static,
{
    let handle = std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let _guard = PanicGuard(state.as_ref());
            tracing::debug!(worker = %name, "worker started");
            match body(state.as_ref()) {
                Ok(()) | Err(FlowError::QueueClosed) => {
                    tracing::debug!(worker = %name, "worker exiting");
                }
                Err(e) => {
                    tracing::error!(worker = %name, error = %e, "worker failed");
                    state.cancel(e);
                }
            }
        })?;
    Ok(handle)
}

/// Cancels the flow if the worker unwinds, so `join` never waits on
/// workers blocked behind a dead stage.
struct PanicGuard<'a>(&'a FlowState);

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0
                .cancel(FlowError::Pipeline("worker thread panicked".into()));
        }
    }
}
