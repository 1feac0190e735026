use batchflow_core::Result;
use batchflow_queue::QueueEnd;

use crate::state::FlowState;

/// Emit the submitted path list once per requested epoch.
pub(crate) fn run_source(state: &FlowState) -> Result<()> {
    loop {
        let epoch = state.queues.epochs.pop(QueueEnd::Head)?;
        if state.is_shutdown() {
            return Ok(());
        }
        state.emit_epoch(epoch)?;
    }
}
