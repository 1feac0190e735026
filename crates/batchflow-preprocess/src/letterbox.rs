use batchflow_core::{FlowError, RawImage, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;

/// Scale factor that fits a `src_w` x `src_h` image inside
/// `dst_w` x `dst_h` without distortion, plus the resized dimensions.
pub fn fit_ratio(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> (f32, u32, u32) {
    let ratio = (dst_h as f32 / src_h as f32).min(dst_w as f32 / src_w as f32);
    let rw = ((src_w as f32 * ratio).round() as u32).clamp(1, dst_w);
    let rh = ((src_h as f32 * ratio).round() as u32).clamp(1, dst_h);
    (ratio, rw, rh)
}

/// Resize `img` to fit `width` x `height` preserving aspect ratio, then pad
/// the bottom and right edges with black. Returns the RGB result and the
/// scale that was applied.
pub fn letterbox(img: &RawImage, width: u32, height: u32) -> Result<(RawImage, f32)> {
    if width == 0 || height == 0 {
        return Err(FlowError::InvalidInput(format!(
            "letterbox target {width}x{height} is empty"
        )));
    }
    let rgb = to_rgb(img)?;
    let (ratio, rw, rh) = fit_ratio(rgb.width(), rgb.height(), width, height);

    let resized = if (rw, rh) == rgb.dimensions() {
        rgb
    } else {
        imageops::resize(&rgb, rw, rh, FilterType::Triangle)
    };

    let canvas = if (rw, rh) == (width, height) {
        resized
    } else {
        let mut canvas = RgbImage::new(width, height);
        imageops::replace(&mut canvas, &resized, 0, 0);
        canvas
    };

    Ok((
        RawImage {
            width,
            height,
            channels: 3,
            data: canvas.into_raw(),
        },
        ratio,
    ))
}

fn to_rgb(img: &RawImage) -> Result<RgbImage> {
    if img.is_empty() {
        return Err(FlowError::InvalidInput("cannot letterbox an empty image".into()));
    }
    let expected = img.pixel_count() * img.channels as usize;
    if img.data.len() != expected {
        return Err(FlowError::InvalidInput(format!(
            "image data is {} bytes, expected {expected} for {}x{}x{}",
            img.data.len(),
            img.width,
            img.height,
            img.channels
        )));
    }

    let data = match img.channels {
        3 => img.data.clone(),
        1 => img.data.iter().flat_map(|&v| [v, v, v]).collect(),
        4 => img
            .data
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect(),
        c => {
            return Err(FlowError::InvalidInput(format!(
                "unsupported channel count {c}"
            )))
        }
    };
    RgbImage::from_raw(img.width, img.height, data)
        .ok_or_else(|| FlowError::InvalidInput("image buffer size mismatch".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_ratio_landscape() {
        let (ratio, w, h) = fit_ratio(1000, 500, 500, 500);
        assert_eq!(ratio, 0.5);
        assert_eq!((w, h), (500, 250));
    }

    #[test]
    fn test_fit_ratio_upscale() {
        let (ratio, w, h) = fit_ratio(100, 200, 500, 500);
        assert_eq!(ratio, 2.5);
        assert_eq!((w, h), (250, 500));
    }

    #[test]
    fn test_letterbox_pads_bottom_right() {
        let img = RawImage {
            data: vec![200; 4 * 2 * 3],
            width: 4,
            height: 2,
            channels: 3,
        };
        let (out, ratio) = letterbox(&img, 8, 8).unwrap();
        assert_eq!(ratio, 2.0);
        assert_eq!((out.width, out.height, out.channels), (8, 8, 3));
        // Top-left is image content, bottom rows are padding.
        assert_eq!(out.data[0], 200);
        let last_row = &out.data[7 * 8 * 3..];
        assert!(last_row.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_letterbox_grayscale_expands() {
        let img = RawImage {
            data: vec![9; 4],
            width: 2,
            height: 2,
            channels: 1,
        };
        let (out, ratio) = letterbox(&img, 2, 2).unwrap();
        assert_eq!(ratio, 1.0);
        assert_eq!(out.data, vec![9; 12]);
    }

    #[test]
    fn test_letterbox_rejects_bad_length() {
        let img = RawImage {
            data: vec![0; 5],
            width: 2,
            height: 2,
            channels: 3,
        };
        assert!(matches!(letterbox(&img, 4, 4), Err(FlowError::InvalidInput(_))));
    }
}
