use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// NCHW shape of one accelerator tensor, per data-parallel stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorShape {
    pub n: usize,
    pub c: usize,
    pub h: usize,
    pub w: usize,
}

impl TensorShape {
    pub fn new(n: usize, c: usize, h: usize, w: usize) -> Self {
        Self { n, c, h, w }
    }

    /// Number of elements in the tensor.
    pub fn count(&self) -> usize {
        self.n * self.c * self.h * self.w
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

/// Channel order of packed host pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Rgb,
    /// Matches models exported from OpenCV-based training code.
    #[default]
    Bgr,
}

/// Raw interleaved u8 image data on the host.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl RawImage {
    /// All-zero image of the given dimensions.
    pub fn blank(width: u32, height: u32, channels: u32) -> Self {
        Self {
            data: vec![0; (width * height * channels) as usize],
            width,
            height,
            channels,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }

    pub fn pixel_count(&self) -> usize {
        (self.width * self.height) as usize
    }
}

/// One submitted input path. `seq` is its position in the submitted list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntry {
    pub seq: u64,
    pub path: PathBuf,
}

impl PathEntry {
    pub fn new(seq: u64, path: impl Into<PathBuf>) -> Self {
        Self {
            seq,
            path: path.into(),
        }
    }
}

/// A decoded, letterboxed image ready for packing.
#[derive(Debug, Clone)]
pub struct HostImage {
    pub seq: u64,
    pub path: PathBuf,
    pub pixels: RawImage,
    /// Scale applied to the source image to fit the model input.
    pub ratio: f32,
}

/// Unit-weight record emitted once per completed input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionMarker {
    pub seq: u64,
    pub weight: u32,
    /// Monotonic completion time, see [`crate::clock::now_us`].
    pub at_us: u64,
}

impl CompletionMarker {
    pub fn new(seq: u64, at_us: u64) -> Self {
        Self {
            seq,
            weight: 1,
            at_us,
        }
    }
}

/// Opaque reference to one accelerator-side allocation.
///
/// Not `Clone`: the holder of a `DeviceMemory` is the only party allowed
/// to hand it to the accelerator.
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceMemory {
    id: u64,
    bytes: usize,
}

impl DeviceMemory {
    /// Wrap a backend-issued allocation id. Only accelerator backends
    /// should construct these.
    pub fn new(id: u64, bytes: usize) -> Self {
        Self { id, bytes }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Allocated size in bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Accelerator cores assigned to one inference context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreAssignment {
    pub core_count: u32,
    /// Bit i set means core i is used.
    pub affinity: u64,
}

impl Default for CoreAssignment {
    fn default() -> Self {
        Self {
            core_count: 1,
            affinity: 0x01,
        }
    }
}
