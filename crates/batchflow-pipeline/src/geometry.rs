use batchflow_core::{Accelerator, ChannelOrder, FlowError, Result};
use batchflow_device::{align_up, TENSOR_ALIGN};
use batchflow_preprocess::PackLayout;

/// Per-call shapes and buffer sizes derived from a loaded model.
///
/// Inputs are u8 NHWC, outputs f32. Every tensor is sized per
/// data-parallel stream, rounded up to [`TENSOR_ALIGN`], then multiplied
/// by the stream count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowGeometry {
    pub data_parallelism: usize,
    /// Images per stream (the model's batch dimension).
    pub batch_dim: usize,
    pub height: u32,
    pub width: u32,
    pub channels: u32,
    pub input_bytes: Vec<usize>,
    pub output_bytes: Vec<usize>,
    /// Output elements per image, one entry per output tensor.
    pub output_counts: Vec<usize>,
}

impl FlowGeometry {
    pub fn derive(accelerator: &dyn Accelerator) -> Result<Self> {
        let dp = accelerator.data_parallelism();
        let input = accelerator
            .input_shapes()
            .first()
            .copied()
            .ok_or_else(|| FlowError::ModelLoad(format!("{} has no inputs", accelerator.name())))?;
        if accelerator.output_shapes().is_empty() {
            return Err(FlowError::ModelLoad(format!(
                "{} has no outputs",
                accelerator.name()
            )));
        }
        if input.n == 0 {
            return Err(FlowError::ModelLoad(format!(
                "{} input has a zero batch dimension",
                accelerator.name()
            )));
        }

        let per_call = |count: usize, elem: usize| align_up(count * elem, TENSOR_ALIGN) * dp;
        let input_bytes = accelerator
            .input_shapes()
            .iter()
            .map(|s| per_call(s.count(), 1))
            .collect();
        let output_bytes = accelerator
            .output_shapes()
            .iter()
            .map(|s| per_call(s.count(), std::mem::size_of::<f32>()))
            .collect();
        let output_counts = accelerator
            .output_counts()
            .into_iter()
            .map(|c| c / input.n)
            .collect();

        Ok(Self {
            data_parallelism: dp,
            batch_dim: input.n,
            height: input.h as u32,
            width: input.w as u32,
            channels: input.c as u32,
            input_bytes,
            output_bytes,
            output_counts,
        })
    }

    /// Real images one invocation consumes.
    pub fn images_per_call(&self) -> usize {
        self.data_parallelism * self.batch_dim
    }

    /// Host layout of the first input tensor.
    pub fn pack_layout(&self, order: ChannelOrder) -> PackLayout {
        PackLayout {
            slots: self.images_per_call(),
            height: self.height,
            width: self.width,
            channels: self.channels,
            order,
        }
    }

    /// Scatter a contiguous packed batch into the per-stream aligned layout
    /// of the first input tensor.
    pub fn stage_input(&self, packed: &[u8]) -> Result<Vec<u8>> {
        let stream_bytes = packed.len() / self.data_parallelism;
        let stride = self.input_bytes[0] / self.data_parallelism;
        if packed.len() % self.data_parallelism != 0 || stream_bytes > stride {
            return Err(FlowError::InvalidInput(format!(
                "packed batch of {} bytes does not fit {} streams of {stride} bytes",
                packed.len(),
                self.data_parallelism
            )));
        }
        let mut staged = vec![0u8; self.input_bytes[0]];
        for (src, dst) in packed
            .chunks_exact(stream_bytes.max(1))
            .zip(staged.chunks_exact_mut(stride))
        {
            dst[..src.len()].copy_from_slice(src);
        }
        Ok(staged)
    }

    /// Slice of output tensor `tensor` belonging to the `image`-th image of
    /// the call, given the tensor copied back to the host as f32.
    pub fn image_output<'a>(&self, tensor: usize, host: &'a [f32], image: usize) -> Option<&'a [f32]> {
        let count = *self.output_counts.get(tensor)?;
        let stride = self.output_bytes.get(tensor)? / self.data_parallelism / std::mem::size_of::<f32>();
        let stream = image / self.batch_dim;
        if stream >= self.data_parallelism {
            return None;
        }
        let start = stream * stride + (image % self.batch_dim) * count;
        host.get(start..start + count)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use batchflow_core::{AcceleratorBackend, LoadRequest};
    use batchflow_device::HostBackend;

    use super::*;

    fn geometry(dp: usize) -> FlowGeometry {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"functions":{{"fusion_0":{{
                "inputs":[{{"n":2,"c":3,"h":4,"w":4}}],
                "outputs":[{{"n":2,"c":4,"h":10,"w":1}}]}}}}}}"#
        )
        .unwrap();
        let accel = HostBackend::new()
            .load(&LoadRequest {
                model_path: file.path().to_path_buf(),
                function_name: "fusion_0".into(),
                device_id: 0,
                data_parallelism: dp,
            })
            .unwrap();
        FlowGeometry::derive(accel.as_ref()).unwrap()
    }

    #[test]
    fn test_sizes_aligned_per_stream() {
        let g = geometry(3);
        assert_eq!(g.images_per_call(), 6);
        assert_eq!((g.height, g.width, g.channels), (4, 4, 3));
        assert_eq!(g.input_bytes, vec![3 * TENSOR_ALIGN]);
        assert_eq!(g.output_bytes, vec![3 * TENSOR_ALIGN]);
        assert_eq!(g.output_counts, vec![40]);
    }

    #[test]
    fn test_stage_input_places_streams_on_stride() {
        let g = geometry(2);
        let image = 4 * 4 * 3;
        let packed: Vec<u8> = (0..4 * image).map(|i| (i % 251) as u8 + 1).collect();
        let staged = g.stage_input(&packed).unwrap();
        assert_eq!(staged.len(), 2 * TENSOR_ALIGN);
        assert_eq!(&staged[..2 * image], &packed[..2 * image]);
        assert_eq!(staged[2 * image], 0);
        assert_eq!(&staged[TENSOR_ALIGN..TENSOR_ALIGN + 2 * image], &packed[2 * image..]);
    }

    #[test]
    fn test_image_output_offsets() {
        let g = geometry(2);
        let stride = TENSOR_ALIGN / 4;
        let host: Vec<f32> = (0..2 * stride).map(|i| i as f32).collect();
        assert_eq!(g.image_output(0, &host, 1).unwrap()[0], 40.0);
        assert_eq!(g.image_output(0, &host, 2).unwrap()[0], stride as f32);
        assert!(g.image_output(0, &host, 4).is_none());
        assert!(g.image_output(1, &host, 0).is_none());
    }
}
