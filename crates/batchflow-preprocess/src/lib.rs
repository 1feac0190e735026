pub mod letterbox;
pub mod loader;
pub mod pack;

pub use letterbox::{fit_ratio, letterbox};
pub use loader::{load_or_blank, FakeImageLoader, FileImageLoader};
pub use pack::{pack_batch, PackLayout};

use batchflow_core::{HostImage, PathEntry, RawImage, Result};

/// Host-side preparation for one model input: letterbox each image to the
/// model's spatial size and pack a batch into the accelerator's layout.
#[derive(Debug, Clone, Copy)]
pub struct Preprocessor {
    layout: PackLayout,
}

impl Preprocessor {
    pub fn new(layout: PackLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &PackLayout {
        &self.layout
    }

    /// Letterbox one decoded image for `entry`.
    pub fn prepare(&self, entry: PathEntry, raw: &RawImage) -> Result<HostImage> {
        let (pixels, ratio) = letterbox(raw, self.layout.width, self.layout.height)?;
        tracing::trace!(
            seq = entry.seq,
            path = %entry.path.display(),
            src_w = raw.width,
            src_h = raw.height,
            ratio,
            "letterboxed image"
        );
        Ok(HostImage {
            seq: entry.seq,
            path: entry.path,
            pixels,
            ratio,
        })
    }

    /// Pack prepared images into one per-call host buffer, zero-filling
    /// unused slots.
    pub fn pack(&self, images: &[HostImage]) -> Result<Vec<u8>> {
        pack_batch(images.iter().map(|img| &img.pixels), &self.layout)
    }
}
