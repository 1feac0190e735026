use batchflow_core::{ChannelOrder, FlowError, RawImage, Result};

/// Layout of one packed per-call input tensor: `slots` images of
/// `height` x `width` x `channels` u8, NHWC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackLayout {
    pub slots: usize,
    pub height: u32,
    pub width: u32,
    pub channels: u32,
    pub order: ChannelOrder,
}

impl PackLayout {
    pub fn image_bytes(&self) -> usize {
        self.height as usize * self.width as usize * self.channels as usize
    }

    pub fn total_bytes(&self) -> usize {
        self.slots * self.image_bytes()
    }
}

/// Pack letterboxed RGB images into one contiguous host buffer.
///
/// Slots past `images.len()` are left zeroed. Single-channel layouts take
/// the luma of each pixel; four-channel layouts get a zero fourth channel.
pub fn pack_batch<'a, I>(images: I, layout: &PackLayout) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a RawImage>,
    I::IntoIter: ExactSizeIterator,
{
    let images = images.into_iter();
    if images.len() > layout.slots {
        return Err(FlowError::InvalidInput(format!(
            "{} images do not fit {} batch slots",
            images.len(),
            layout.slots
        )));
    }
    if !matches!(layout.channels, 1 | 3 | 4) {
        return Err(FlowError::InvalidInput(format!(
            "unsupported packed channel count {}",
            layout.channels
        )));
    }

    let per_image = layout.image_bytes();
    let mut out = vec![0u8; layout.total_bytes()];
    for (img, dst) in images.zip(out.chunks_exact_mut(per_image)) {
        if img.width != layout.width || img.height != layout.height || img.channels != 3 {
            return Err(FlowError::InvalidInput(format!(
                "packed image is {}x{}x{}, expected {}x{}x3",
                img.width, img.height, img.channels, layout.width, layout.height
            )));
        }
        pack_image(&img.data, dst, layout.channels as usize, layout.order);
    }
    Ok(out)
}

fn pack_image(rgb: &[u8], dst: &mut [u8], channels: usize, order: ChannelOrder) {
    for (px, out) in rgb.chunks_exact(3).zip(dst.chunks_exact_mut(channels)) {
        let (r, g, b) = (px[0], px[1], px[2]);
        match channels {
            1 => out[0] = ((r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000) as u8,
            _ => {
                let [c0, c1, c2] = match order {
                    ChannelOrder::Rgb => [r, g, b],
                    ChannelOrder::Bgr => [b, g, r],
                };
                out[..3].copy_from_slice(&[c0, c1, c2]);
            }
        }
    }
}
