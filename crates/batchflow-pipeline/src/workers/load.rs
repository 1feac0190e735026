use batchflow_core::{ImageLoader, Result};
use batchflow_preprocess::load_or_blank;
use batchflow_queue::QueueEnd;

use crate::batch::LoadedImage;
use crate::state::FlowState;

/// Decode paths into raw images ahead of preprocessing.
pub(crate) fn run_loader(state: &FlowState, loader: &dyn ImageLoader) -> Result<()> {
    loop {
        let entry = state.queues.paths.pop(QueueEnd::Head)?;
        if state.is_shutdown() {
            return Ok(());
        }
        let image = load_or_blank(loader, &entry.path);
        tracing::trace!(seq = entry.seq, path = %entry.path.display(), width = image.width, height = image.height, "decoded image");
        state
            .queues
            .raw_images
            .push(LoadedImage { entry, image }, QueueEnd::Tail)?;
    }
}
