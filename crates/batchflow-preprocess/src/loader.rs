use std::path::Path;

use batchflow_core::{FlowError, ImageLoader, RawImage, Result};

/// Decodes image files from disk into interleaved RGB.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileImageLoader;

impl ImageLoader for FileImageLoader {
    fn load(&self, path: &Path) -> Result<RawImage> {
        let img = image::open(path)
            .map_err(|e| FlowError::ImageDecode(format!("{}: {e}", path.display())))?;
        let rgb = img.to_rgb8();
        Ok(RawImage {
            width: rgb.width(),
            height: rgb.height(),
            channels: 3,
            data: rgb.into_raw(),
        })
    }
}

/// Returns the same synthetic image for every path without touching the
/// filesystem. Used to measure the pipeline without decode cost.
#[derive(Debug, Clone)]
pub struct FakeImageLoader {
    image: RawImage,
}

impl FakeImageLoader {
    /// Diagonal gradient of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                let v = ((x + y) % 256) as u8;
                data.extend_from_slice(&[v, v / 2, 255 - v]);
            }
        }
        Self {
            image: RawImage {
                data,
                width,
                height,
                channels: 3,
            },
        }
    }
}

impl Default for FakeImageLoader {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl ImageLoader for FakeImageLoader {
    fn load(&self, _path: &Path) -> Result<RawImage> {
        Ok(self.image.clone())
    }
}

/// Load `path`, substituting a 1x1 black image when decoding fails or
/// yields nothing. A bad input never stops the pipeline.
pub fn load_or_blank(loader: &dyn ImageLoader, path: &Path) -> RawImage {
    match loader.load(path) {
        Ok(img) if !img.is_empty() => img,
        Ok(_) => {
            tracing::warn!(path = %path.display(), "decoded empty image, substituting blank");
            RawImage::blank(1, 1, 3)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "image load failed, substituting blank");
            RawImage::blank(1, 1, 3)
        }
    }
}
